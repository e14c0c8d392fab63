use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 3 {
        eprintln!("Usage: {} [scan_id] [database_url]", args[0]);
        eprintln!("Prints the outcomes of one scan, the latest when no id is given.");
        std::process::exit(1);
    }

    let database_url = args
        .get(2)
        .map(String::as_str)
        .unwrap_or("sqlite://gmail-triage.db");
    let pool = SqlitePoolOptions::new()
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let scan = match args.get(1) {
        Some(id) => {
            let id: i64 = id
                .parse()
                .map_err(|_| anyhow::anyhow!("Scan id must be a number, got '{}'", id))?;
            sqlx::query("SELECT id, started_at, state, dry_run, error FROM scans WHERE id = ?")
                .bind(id)
                .fetch_optional(&pool)
                .await?
        }
        None => {
            sqlx::query(
                "SELECT id, started_at, state, dry_run, error FROM scans
                 ORDER BY started_at DESC, id DESC
                 LIMIT 1",
            )
            .fetch_optional(&pool)
            .await?
        }
    };

    let Some(scan) = scan else {
        println!("No matching scan found");
        return Ok(());
    };

    let scan_id: i64 = scan.get("id");
    let started_at: String = scan.get("started_at");
    let state: String = scan.get("state");
    let dry_run: bool = scan.get("dry_run");
    let error: Option<String> = scan.get("error");

    println!("Scan #{}", scan_id);
    println!("Started: {}", started_at);
    println!("State: {}{}", state, if dry_run { " (dry run)" } else { "" });
    if let Some(error) = error {
        println!("Error: {}", error);
    }
    println!(
        "--------------------------------------------------------------------------------"
    );

    let rows = sqlx::query(
        "SELECT position, message_id, subject, outcome, classification, filed_under, detail
         FROM scan_outcomes
         WHERE scan_id = ?
         ORDER BY position",
    )
    .bind(scan_id)
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("(no messages)");
    }

    for row in rows {
        let position: i64 = row.get("position");
        let message_id: String = row.get("message_id");
        let subject: Option<String> = row.get("subject");
        let outcome: String = row.get("outcome");
        let classification: Option<String> = row.get("classification");
        let filed_under: Option<String> = row.get("filed_under");
        let detail: Option<String> = row.get("detail");

        println!(
            "{:>3}. {:<7} {} {:?}",
            position + 1,
            outcome,
            message_id,
            subject.unwrap_or_default()
        );
        if let Some(label) = filed_under {
            println!("     filed under {}", label);
        }
        if let Some(detail) = detail {
            match classification {
                Some(verdict) => println!("     {} (classified as {})", detail, verdict),
                None => println!("     {}", detail),
            }
        }
    }

    Ok(())
}
