use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use ccl_fx::{NbpRateSource, RateSource};

#[derive(Parser)]
#[command(name = "ccl")]
#[command(about = "Covered-call ledger admin CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Look up the PLN/USD rate effective for a date (NBP table A)
    Rate {
        /// Date (YYYY-MM-DD); the D-1 preceding trading day is resolved
        #[arg(long)]
        date: NaiveDate,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Connectivity and schema presence
    Status,

    /// Apply embedded migrations
    Migrate,

    /// Recompute the ledger derivations and report mismatches
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // dev-time .env.local bootstrap; absence is fine
    dotenvy::from_filename(".env.local").ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ccl_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = ccl_db::status(&pool).await?;
                    println!("db_ok={} has_lots_table={}", s.ok, s.has_lots_table);
                }
                DbCmd::Migrate => {
                    ccl_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
                DbCmd::Check => {
                    let report = ccl_db::check_integrity(&pool).await?;
                    println!(
                        "clean={} lots_checked={} obligations_checked={}",
                        report.is_clean(),
                        report.lots_checked,
                        report.obligations_checked
                    );
                    for m in &report.lot_mismatches {
                        println!(
                            "lot_mismatch id={} ticker={} quantity_open={} derived_open={}",
                            m.lot_id, m.ticker, m.quantity_open, m.derived_open
                        );
                    }
                    for m in &report.obligation_mismatches {
                        println!(
                            "obligation_mismatch id={} ticker={} reserved={} obligated={}",
                            m.obligation_id, m.ticker, m.reserved, m.obligated
                        );
                    }
                    if !report.is_clean() {
                        anyhow::bail!("ledger derivations do not match stored quantities");
                    }
                }
            }
        }

        Commands::Rate { date } => {
            let src = NbpRateSource::new();
            let quote = src.rate_for(ccl_fx::d1(date)).await?;
            println!(
                "date={} effective_date={} rate={}",
                date, quote.effective_date, quote.rate
            );
        }
    }

    Ok(())
}
