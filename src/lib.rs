//! Tradebot: a daemonless, file-first equities trading core.
//!
//! **Tradebot is the scheduling and accounting spine of an automated
//! trading system.** Everything of consequence is a file or a SQLite row:
//! the lifecycle token, control flags, the daily schedule, the double-entry
//! ledger, versioned COA mappings, and append-only JSONL audit trails.
//!
//! # Core principles
//!
//! - **File-first**: all state is local, atomic (temp+rename), and auditable
//! - **Cooperative multi-process**: the supervisor spawns one dispatcher per
//!   trading day; the dispatcher spawns one phase worker per phase, serially
//! - **Deterministic**: FITIDs and group ids are stable hashes; journals are
//!   zero-sum; mapping versions only go up
//! - **Everything audited**: postings, rejects, lot events, mapping changes
//!
//! # Architecture
//!
//! ## Subsystems
//!
//! - [`core`]: identity, context, paths, config, atomic files, SQLite, state
//! - [`accounting`]: COA store, mapping table, normalizer, lots, ledger
//! - [`runtime`]: supervisor, dispatcher, maintenance workers, broker sync
//! - [`strategy`]: thin breakout phase workers + trailing-stop math
//! - [`broker`]: adapter boundary (HTTP adapters live outside this crate)
//!
//! ## A trading day
//!
//! ```bash
//! # Compute today's schedule and launch the dispatcher
//! tradebot supervisor run
//!
//! # Pull broker activity into the ledger
//! tradebot sync run --from 2025-02-01 --to 2025-02-10 --payload replay.json
//!
//! # Inspect the books
//! tradebot ledger balances
//! tradebot audit timeline
//! ```

pub mod accounting;
pub mod broker;
pub mod core;
pub mod runtime;
pub mod strategy;

use crate::accounting::ledger::{balance, dedupe, double_entry, grouping, posting};
use crate::accounting::{coa, mapping};
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::{audit, db, flags, state};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser, Debug)]
#[clap(
    name = "tradebot",
    version = env!("CARGO_PKG_VERSION"),
    about = "Daemonless equities trading core: time-gated phase scheduler + double-entry ledger",
    disable_version_flag = true
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute today's schedule and spawn the dispatcher
    #[clap(name = "supervisor")]
    Supervisor(SupervisorCli),

    /// Execute today's schedule (normally spawned by the supervisor)
    #[clap(name = "dispatcher")]
    Dispatcher(DispatcherCli),

    /// Run one strategy phase worker
    #[clap(name = "strategy")]
    Strategy {
        /// Session: open, mid, or close
        session: String,
    },

    /// Run the holdings maintenance worker
    #[clap(name = "holdings")]
    Holdings {
        /// Session this holdings pass follows: open or mid
        #[clap(long)]
        session: String,
    },

    /// Universe rebuild worker
    #[clap(name = "universe")]
    Universe(UniverseCli),

    /// Broker → ledger synchronization
    #[clap(name = "sync")]
    Sync(SyncCli),

    /// Ledger queries and maintenance
    #[clap(name = "ledger")]
    Ledger(LedgerCli),

    /// COA mapping table (versioned, append-only)
    #[clap(name = "mapping")]
    Mapping(MappingCli),

    /// Chart of Accounts store
    #[clap(name = "coa")]
    Coa(CoaCli),

    /// Lifecycle state file
    #[clap(name = "state")]
    State(StateCli),

    /// Control flags (stop/kill/start/test-mode)
    #[clap(name = "control")]
    Control(ControlCli),

    /// Render the merged audit timeline
    #[clap(name = "audit")]
    Audit(AuditCli),

    /// Print status.json plus stamp freshness
    #[clap(name = "status")]
    Status,

    /// Show version information
    #[clap(name = "version")]
    Version,
}

#[derive(clap::Args, Debug)]
struct SupervisorCli {
    #[clap(subcommand)]
    command: SupervisorCommand,
}

#[derive(Subcommand, Debug)]
enum SupervisorCommand {
    /// Write schedule.json, skip non-trading days, spawn the dispatcher
    Run {
        /// Exit right after spawning instead of babysitting the dispatcher
        #[clap(long)]
        detach: bool,
    },
}

#[derive(clap::Args, Debug)]
struct DispatcherCli {
    #[clap(subcommand)]
    command: DispatcherCommand,
}

#[derive(Subcommand, Debug)]
enum DispatcherCommand {
    /// Execute the phases of the current schedule.json
    Run,
}

#[derive(clap::Args, Debug)]
struct UniverseCli {
    #[clap(subcommand)]
    command: UniverseCommand,
}

#[derive(Subcommand, Debug)]
enum UniverseCommand {
    /// Run the (thin) universe rebuild phase worker
    Rebuild,
}

#[derive(clap::Args, Debug)]
struct SyncCli {
    #[clap(subcommand)]
    command: SyncCommand,
}

#[derive(Subcommand, Debug)]
enum SyncCommand {
    /// Run one sync cycle over an inclusive date range
    Run {
        /// Range start (YYYY-MM-DD)
        #[clap(long)]
        from: String,
        /// Range end (YYYY-MM-DD)
        #[clap(long)]
        to: String,
        /// Captured broker payload to replay (JSON file)
        #[clap(long)]
        payload: std::path::PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct LedgerCli {
    #[clap(subcommand)]
    command: LedgerCommand,
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// Per-account balances as of a UTC timestamp
    Balances {
        #[clap(long)]
        as_of: Option<String>,
        #[clap(long)]
        window_start: Option<String>,
    },
    /// Verify every journal sums to zero
    Validate,
    /// List (and optionally repair) duplicate (trade_id, side) rows
    Dedupe {
        /// Delete duplicates, keeping the lowest id
        #[clap(long)]
        repair: bool,
    },
    /// Show recent journals as grouped legs
    Groups {
        #[clap(long, default_value = "20")]
        limit: usize,
    },
    /// Flat entry listing with optional filters, newest first
    Entries {
        #[clap(long)]
        account: Option<String>,
        #[clap(long)]
        symbol: Option<String>,
        #[clap(long)]
        since: Option<String>,
        #[clap(long)]
        until: Option<String>,
        #[clap(long, default_value = "50")]
        limit: usize,
    },
    /// Open lot inventory and realized P&L by symbol
    Lots,
    /// Persist UI collapse state for a journal
    Collapse {
        group_id: String,
        #[clap(long)]
        expand: bool,
    },
    /// Post a manual journal through the trade primitives
    Post {
        /// BUY, SELL, SHORT_OPEN, SHORT_COVER, DIVIDEND, INTEREST,
        /// DEPOSIT, WITHDRAWAL, FEE
        #[clap(long)]
        action: String,
        #[clap(long)]
        symbol: Option<String>,
        #[clap(long, default_value = "0")]
        qty: f64,
        #[clap(long, default_value = "0")]
        price: f64,
        #[clap(long, default_value = "0")]
        fee: f64,
        #[clap(long)]
        trade_id: String,
        #[clap(long)]
        ts: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct MappingCli {
    #[clap(subcommand)]
    command: MappingCommand,
}

#[derive(Subcommand, Debug)]
enum MappingCommand {
    /// Create/replace a rule (append-only; bumps the table version)
    Assign {
        #[clap(long)]
        broker: Option<String>,
        #[clap(long = "type")]
        txn_type: Option<String>,
        #[clap(long)]
        subtype: Option<String>,
        #[clap(long)]
        description: Option<String>,
        #[clap(long)]
        debit: String,
        #[clap(long)]
        credit: String,
        #[clap(long)]
        code: Option<String>,
        #[clap(long, default_value = "cli")]
        user: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Show the live table (or a snapshot version)
    Export {
        #[clap(long)]
        version: Option<i64>,
    },
    /// Replace the rows wholesale from a JSON file
    Import {
        file: std::path::PathBuf,
        #[clap(long, default_value = "import")]
        user: String,
    },
    /// Roll the live table back to a snapshot version
    Rollback {
        version: i64,
    },
    /// Verify required COA codes are referenced ('111x' = prefix wildcard)
    Ensure {
        codes: Vec<String>,
    },
    /// Print the current table version
    Version,
}

#[derive(clap::Args, Debug)]
struct CoaCli {
    #[clap(subcommand)]
    command: CoaCommand,
}

#[derive(Subcommand, Debug)]
enum CoaCommand {
    /// Seed the default COA if none exists
    Init {
        #[clap(long, default_value = "cli")]
        user: String,
    },
    /// Validate the stored COA structure
    Validate,
    /// Export the COA
    Export {
        /// Format: json, md, or csv
        #[clap(long, default_value = "json")]
        format: String,
    },
}

#[derive(clap::Args, Debug)]
struct StateCli {
    #[clap(subcommand)]
    command: StateCommand,
}

#[derive(Subcommand, Debug)]
enum StateCommand {
    /// Print the current lifecycle token
    Get,
    /// Write a lifecycle token
    Set {
        token: String,
        #[clap(long)]
        reason: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct ControlCli {
    #[clap(subcommand)]
    command: ControlCommand,
}

#[derive(Subcommand, Debug)]
enum ControlCommand {
    /// Request a graceful stop after the current phase
    Stop,
    /// Request an abort at the next phase boundary
    Kill,
    /// Raise the start flag
    Start,
    /// Toggle test mode on
    TestMode,
    /// Clear all control flags
    Clear,
}

#[derive(clap::Args, Debug)]
struct AuditCli {
    #[clap(subcommand)]
    command: AuditCommand,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Merge ledger + mapping trails into one time-sorted view
    Timeline {
        #[clap(long, default_value = "100")]
        limit: usize,
        /// Output format: text or json
        #[clap(long, default_value = "text")]
        format: String,
    },
}

/// CLI entry point; returns the process exit code.
pub fn run() -> Result<i32, TbotError> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("v{}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    let ctx = Context::from_env()?;
    let cfg = Config::load()?;

    match cli.command {
        Command::Version => unreachable!(),
        Command::Supervisor(sup) => match sup.command {
            SupervisorCommand::Run { detach } => runtime::supervisor::run(&ctx, &cfg, detach),
        },
        Command::Dispatcher(dsp) => match dsp.command {
            DispatcherCommand::Run => runtime::dispatcher::run(&ctx, &cfg),
        },
        Command::Strategy { session } => {
            let outcome = strategy::route(&ctx, &cfg, &session)?;
            println!(
                "{}",
                json!({
                    "session": session,
                    "skipped": outcome.skipped,
                    "reason": outcome.reason,
                    "signals": outcome.signals,
                })
            );
            Ok(0)
        }
        Command::Holdings { session } => {
            let outcome = runtime::workers::run_holdings(&ctx, &session)?;
            println!(
                "{}",
                json!({"session": session, "skipped": outcome.skipped, "reason": outcome.reason})
            );
            Ok(0)
        }
        Command::Universe(uni) => match uni.command {
            UniverseCommand::Rebuild => {
                let outcome = runtime::workers::run_universe(&ctx)?;
                println!(
                    "{}",
                    json!({"skipped": outcome.skipped, "reason": outcome.reason})
                );
                Ok(0)
            }
        },
        Command::Sync(sync) => match sync.command {
            SyncCommand::Run { from, to, payload } => {
                let adapter = broker::ReplayAdapter::new(&payload);
                let report = runtime::sync::run(&ctx, &cfg, &adapter, &from, &to)?;
                println!(
                    "{}",
                    json!({
                        "sync_run_id": report.sync_run_id,
                        "fetched": report.fetched,
                        "posted": report.posted,
                        "rejected": report.rejected,
                        "pending": report.pending,
                        "quarantined": report.quarantined,
                        "opening_balances_posted": report.opening_balances_posted,
                    })
                );
                Ok(if report.pending > 0 { 1 } else { 0 })
            }
        },
        Command::Ledger(ledger) => run_ledger_command(&ctx, ledger),
        Command::Mapping(map) => run_mapping_command(&ctx, map),
        Command::Coa(coa_cli) => run_coa_command(&ctx, coa_cli),
        Command::State(st) => match st.command {
            StateCommand::Get => {
                println!("{}", state::get_state(&ctx, "running"));
                Ok(0)
            }
            StateCommand::Set { token, reason } => {
                let written = state::set_state(&ctx, &token, reason.as_deref())?;
                println!("{}", written);
                Ok(0)
            }
        },
        Command::Control(ctl) => {
            match ctl.command {
                ControlCommand::Stop => flags::raise_flag(&ctx, flags::ControlFlag::Stop)?,
                ControlCommand::Kill => flags::raise_flag(&ctx, flags::ControlFlag::Kill)?,
                ControlCommand::Start => flags::raise_flag(&ctx, flags::ControlFlag::Start)?,
                ControlCommand::TestMode => {
                    std::fs::write(crate::core::paths::test_mode_flag_path(&ctx)?, b"")?;
                }
                ControlCommand::Clear => {
                    for flag in [
                        flags::ControlFlag::Stop,
                        flags::ControlFlag::Kill,
                        flags::ControlFlag::Start,
                    ] {
                        flags::clear_flag(&ctx, flag)?;
                    }
                    flags::clear_test_mode(&ctx)?;
                }
            }
            Ok(0)
        }
        Command::Audit(audit_cli) => match audit_cli.command {
            AuditCommand::Timeline { limit, format } => {
                audit::render_timeline(&ctx, limit, &format)?;
                Ok(0)
            }
        },
        Command::Status => {
            let mut doc = runtime::status::current_status(&ctx);
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("lifecycle".into(), json!(state::get_state(&ctx, "running")));
                obj.insert(
                    "strategy_ran_today".into(),
                    json!({
                        "open": strategy::last_run_today(&ctx, strategy::Session::Open),
                        "mid": strategy::last_run_today(&ctx, strategy::Session::Mid),
                        "close": strategy::last_run_today(&ctx, strategy::Session::Close),
                    }),
                );
            }
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(0)
        }
    }
}

fn run_ledger_command(ctx: &Context, cli: LedgerCli) -> Result<i32, TbotError> {
    match cli.command {
        LedgerCommand::Balances {
            as_of,
            window_start,
        } => {
            let conn = db::open_ledger(ctx)?;
            let balances = balance::calculate_account_balances(
                &conn,
                as_of.as_deref(),
                window_start.as_deref(),
            )?;
            let mut accounts: Vec<&String> = balances.keys().collect();
            accounts.sort();
            let view: serde_json::Map<String, serde_json::Value> = accounts
                .into_iter()
                .map(|a| {
                    let b = &balances[a];
                    (
                        a.clone(),
                        json!({
                            "opening_balance": b.opening_balance.to_string(),
                            "debits": b.debits.to_string(),
                            "credits": b.credits.to_string(),
                            "closing_balance": b.closing_balance.to_string(),
                        }),
                    )
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(0)
        }
        LedgerCommand::Validate => {
            let conn = db::open_ledger(ctx)?;
            match double_entry::validate_double_entry(&conn) {
                Ok(()) => {
                    println!("{}", json!({"status": "ok"}));
                    Ok(0)
                }
                Err(e) => {
                    println!("{}", json!({"status": "imbalanced", "detail": e.to_string()}));
                    Ok(1)
                }
            }
        }
        LedgerCommand::Dedupe { repair } => {
            let conn = db::open_ledger(ctx)?;
            let dups = dedupe::find_duplicates(&conn, 1000)?;
            if repair {
                let removed = dedupe::remove_duplicates(&conn)?;
                println!("{}", json!({"duplicates": dups.len(), "removed": removed}));
            } else {
                println!("{}", json!({"duplicates": dups.len()}));
            }
            Ok(0)
        }
        LedgerCommand::Groups { limit } => {
            let conn = db::open_ledger(ctx)?;
            let groups = grouping::fetch_groups(&conn, limit)?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
            Ok(0)
        }
        LedgerCommand::Entries {
            account,
            symbol,
            since,
            until,
            limit,
        } => {
            let conn = db::open_ledger(ctx)?;
            let entries = grouping::fetch_entries(
                &conn,
                &grouping::EntryFilter {
                    account,
                    symbol,
                    since_utc: since,
                    until_utc: until,
                    limit,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(0)
        }
        LedgerCommand::Lots => {
            let conn = db::open_ledger(ctx)?;
            let open = crate::accounting::lots::open_lots(&conn)?;
            let realized = crate::accounting::lots::realized_by_symbol(&conn)?;
            let realized: serde_json::Map<String, serde_json::Value> = realized
                .into_iter()
                .map(|(symbol, pnl)| (symbol, json!(pnl)))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "open_lots": open,
                    "realized_by_symbol": realized,
                }))?
            );
            Ok(0)
        }
        LedgerCommand::Collapse { group_id, expand } => {
            let conn = db::open_ledger(ctx)?;
            grouping::set_group_collapsed(&conn, &group_id, !expand)?;
            Ok(0)
        }
        LedgerCommand::Post {
            action,
            symbol,
            qty,
            price,
            fee,
            trade_id,
            ts,
        } => {
            let mut conn = db::open_ledger(ctx)?;
            let result = posting::post_trade(
                ctx,
                &mut conn,
                &action,
                symbol.as_deref(),
                qty,
                price,
                fee,
                &trade_id,
                ts.as_deref(),
                &posting::PostMeta {
                    actor: Some("cli".to_string()),
                    ..Default::default()
                },
            )?;
            println!(
                "{}",
                json!({
                    "legs": result.legs,
                    "basis": result.basis,
                    "proceeds": result.proceeds,
                    "realized": result.realized,
                })
            );
            Ok(0)
        }
    }
}

fn run_mapping_command(ctx: &Context, cli: MappingCli) -> Result<i32, TbotError> {
    match cli.command {
        MappingCommand::Assign {
            broker,
            txn_type,
            subtype,
            description,
            debit,
            credit,
            code,
            user,
            reason,
        } => {
            let table = mapping::assign(
                ctx,
                &mapping::MappingRule {
                    match_spec: mapping::MatchSpec {
                        broker,
                        txn_type,
                        subtype,
                        description,
                    },
                    debit_account: debit,
                    credit_account: credit,
                    code,
                },
                &user,
                reason.as_deref(),
            )?;
            println!("{}", json!({"version_id": table.meta.version_id}));
            Ok(0)
        }
        MappingCommand::Export { version } => {
            println!("{}", mapping::export(ctx, version)?);
            Ok(0)
        }
        MappingCommand::Import { file, user } => {
            let raw = std::fs::read_to_string(&file)?;
            let table = mapping::import(ctx, &raw, &user)?;
            println!(
                "{}",
                json!({"version_id": table.meta.version_id, "rows": table.rows.len()})
            );
            Ok(0)
        }
        MappingCommand::Rollback { version } => {
            let table = mapping::rollback(ctx, version)?;
            println!(
                "{}",
                json!({"version_id": table.meta.version_id, "rolled_back_to": version})
            );
            Ok(0)
        }
        MappingCommand::Ensure { codes } => {
            let refs: Vec<&str> = codes.iter().map(String::as_str).collect();
            match mapping::ensure_required(ctx, &refs) {
                Ok(()) => {
                    println!("{}", json!({"status": "ok"}));
                    Ok(0)
                }
                Err(e) => {
                    println!("{}", json!({"status": "missing", "detail": e.to_string()}));
                    Ok(1)
                }
            }
        }
        MappingCommand::Version => {
            println!("{}", mapping::get_version(ctx)?);
            Ok(0)
        }
    }
}

fn run_coa_command(ctx: &Context, cli: CoaCli) -> Result<i32, TbotError> {
    match cli.command {
        CoaCommand::Init { user } => {
            let created = coa::bootstrap_default(ctx, &user)?;
            println!("{}", json!({"created": created}));
            Ok(0)
        }
        CoaCommand::Validate => {
            let bundle = coa::load(ctx)?;
            println!(
                "{}",
                json!({"status": "ok", "accounts": bundle.accounts_flat.len()})
            );
            Ok(0)
        }
        CoaCommand::Export { format } => {
            let bundle = coa::load(ctx)?;
            match format.as_str() {
                "md" => println!("{}", coa::export_markdown(&bundle.metadata, &bundle.accounts)),
                "csv" => println!("{}", coa::export_csv(&bundle.accounts)),
                _ => println!("{}", serde_json::to_string_pretty(&bundle.accounts)?),
            }
            Ok(0)
        }
    }
}
