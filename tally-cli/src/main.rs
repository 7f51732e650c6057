use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tally_core::{SmsRule, SyncEntity, Transaction, TransactionKind};
use tally_ingest::{
    CompiledRule, DuplicatePolicy, ParseRule, SmsIngestor, SmsParser, read_sms_export,
};
use tally_sync::{Collection, InMemoryStore, Query, ReadSource, SyncRepository, SyncStatus};
use tracing_subscriber::EnvFilter;

mod config;
mod state;

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    version,
    about = "Track expenses from bank SMS notifications"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write ~/.tally/config.toml and an empty store
    Init,

    /// Try a rule template against an SMS body without storing anything
    Parse {
        /// Regex template with AMOUNT / CURRENCY / MERCHANT / DATE placeholders
        #[arg(long)]
        template: String,

        #[arg(long)]
        body: String,

        /// credit or debit
        #[arg(long, default_value = "debit")]
        kind: TransactionKind,

        /// Overrides [parser] duplicate_policy from the config
        #[arg(long)]
        policy: Option<DuplicatePolicy>,
    },

    /// Manage SMS parsing rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },

    /// Record transactions from an SMS export CSV (address,date,body)
    Ingest {
        #[arg(long)]
        csv: PathBuf,

        /// Account id for recorded transactions (default: [ingest] default_account)
        #[arg(long)]
        account: Option<String>,

        /// IANA timezone of the export's local timestamps (default: [ingest] timezone)
        #[arg(long)]
        timezone: Option<String>,
    },

    /// List recorded transactions, newest first
    Transactions {
        #[arg(long)]
        account: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    /// Add a rule for one SMS sender
    Add {
        /// Sender address, e.g. VM-HDFCBK
        #[arg(long)]
        sender: String,

        #[arg(long)]
        template: String,

        #[arg(long, default_value = "debit")]
        kind: TransactionKind,

        #[arg(long, default_value = "local")]
        owner: String,
    },

    List,

    /// Tombstone a rule by id
    Delete { id: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Init => {
            config::init_config()?;
            let store_path = state::store_path()?;
            if store_path.exists() {
                println!("Store already exists: {}", store_path.display());
            } else {
                state::save_store(&InMemoryStore::new())?;
                println!("Wrote {}", store_path.display());
            }
        }

        Command::Parse {
            template,
            body,
            kind,
            policy,
        } => {
            let cfg = config::load_config()?;
            parse_once(&template, &body, kind, policy.unwrap_or(cfg.parser.duplicate_policy))?;
        }

        Command::Rules { command } => match command {
            RulesCommand::Add {
                sender,
                template,
                kind,
                owner,
            } => add_rule(SmsRule::new(owner, sender, template, kind)).await?,
            RulesCommand::List => list_rules().await?,
            RulesCommand::Delete { id } => delete_rule(&id).await?,
        },

        Command::Ingest {
            csv,
            account,
            timezone,
        } => ingest(csv, account, timezone).await?,

        Command::Transactions { account, limit } => list_transactions(account, limit).await?,
    }

    Ok(())
}

fn parse_once(
    template: &str,
    body: &str,
    kind: TransactionKind,
    policy: DuplicatePolicy,
) -> Result<()> {
    let rule = ParseRule::new("cli", template, kind);
    let compiled = CompiledRule::compile(&rule).context("compiling template")?;
    println!("pattern: {}", compiled.pattern());

    match compiled.extract(body, policy) {
        Some(parsed) => println!("{}", serde_json::to_string_pretty(&parsed)?),
        None => println!("no match"),
    }
    Ok(())
}

/// Wait for a repository's first snapshot; a stalled bootstrap is an error.
async fn settle<T: SyncEntity>(repo: &SyncRepository<T>) -> Result<SyncStatus> {
    repo.load_all();
    let status = repo.wait_settled().await;
    if status.is_stalled() {
        bail!(
            "sync stalled: {}",
            status.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(status)
}

async fn add_rule(mut rule: SmsRule) -> Result<()> {
    CompiledRule::compile(&ParseRule::from(&rule)).context("rule template is not usable")?;

    let cfg = config::load_config()?;
    let store = state::open_store()?;
    let rules: SyncRepository<SmsRule> =
        SyncRepository::new(store.clone(), cfg.sync.to_sync_config());

    // Check-then-save; a concurrent writer could still add the same rule.
    let existing = rules
        .find_by_query(
            &Query::active()
                .field_eq("sender", rule.sender.clone())
                .field_eq("template", rule.template.clone()),
        )
        .await?;
    if let Some(dup) = existing.first() {
        bail!("rule already exists: {}", dup.id().unwrap_or("?"));
    }

    rules.save(&mut rule).await?;
    state::save_store(&store)?;
    println!("Added rule {}", rule.id().unwrap_or("?"));
    Ok(())
}

async fn list_rules() -> Result<()> {
    let cfg = config::load_config()?;
    let store = state::open_store()?;
    let rules = SyncRepository::with_comparator(
        store,
        cfg.sync.to_sync_config(),
        |a: &SmsRule, b: &SmsRule| {
            a.sender
                .cmp(&b.sender)
                .then_with(|| a.template.cmp(&b.template))
        },
    );
    settle(&rules).await?;

    let snapshot = rules.snapshot();
    if snapshot.is_empty() {
        println!("No rules. Add one: tally rules add --sender <addr> --template <regex>");
    }
    for rule in snapshot.iter() {
        println!(
            "{} | {} | {:?} | {}",
            rule.id().unwrap_or("?"),
            rule.sender,
            rule.kind,
            rule.template
        );
    }
    rules.close();
    Ok(())
}

async fn delete_rule(id: &str) -> Result<()> {
    let cfg = config::load_config()?;
    let store = state::open_store()?;
    let rules: SyncRepository<SmsRule> =
        SyncRepository::new(store.clone(), cfg.sync.to_sync_config());

    rules
        .delete_by_id(id)
        .await
        .with_context(|| format!("deleting rule {id}"))?;
    state::save_store(&store)?;
    println!("Deleted rule {id}");
    Ok(())
}

async fn ingest(csv: PathBuf, account: Option<String>, timezone: Option<String>) -> Result<()> {
    let cfg = config::load_config()?;
    if !csv.exists() {
        bail!("CSV not found: {}", csv.display());
    }

    let tz = timezone.unwrap_or_else(|| cfg.ingest.timezone.clone());
    let messages = read_sms_export(&csv, &tz)?;

    let store = state::open_store()?;
    let rules = Collection::<SmsRule>::new(store.clone())
        .query_active(ReadSource::Server)
        .await?;
    if rules.is_empty() {
        bail!("No SMS rules yet. Add one: tally rules add --sender <addr> --template <regex>");
    }

    let mut ingestor = SmsIngestor::new(
        store.clone(),
        &rules,
        SmsParser::with_policy(cfg.parser.duplicate_policy),
    );
    if let Some(account) = account.or(cfg.ingest.default_account) {
        ingestor = ingestor.with_account(account);
    }

    let summary = ingestor.ingest_all(&messages).await?;
    state::save_store(&store)?;

    println!("Read {} messages from {}", messages.len(), csv.display());
    println!(
        "Recorded {} | duplicates {} | no rule matched {}",
        summary.recorded, summary.duplicates, summary.unmatched
    );
    Ok(())
}

async fn list_transactions(account: Option<String>, limit: usize) -> Result<()> {
    let cfg = config::load_config()?;
    let store = state::open_store()?;
    let repo = SyncRepository::with_comparator(
        store,
        cfg.sync.to_sync_config(),
        |a: &Transaction, b: &Transaction| b.occurred_on.cmp(&a.occurred_on),
    );
    settle(&repo).await?;

    let snapshot = repo.snapshot();
    let txns: Vec<&Transaction> = snapshot
        .iter()
        .filter(|t| account.is_none() || t.account_id == account)
        .collect();

    let (income, spent) = txns.iter().fold((Decimal::ZERO, Decimal::ZERO), |(inc, exp), t| {
        if t.is_expense() {
            (inc, exp + t.amount)
        } else {
            (inc + t.amount, exp)
        }
    });

    for t in txns.iter().take(limit) {
        println!(
            "{} {:>12} {:<4} {:<24} {}",
            t.occurred_on,
            t.signed_amount().to_string(),
            t.currency.as_deref().unwrap_or(""),
            t.merchant.as_deref().unwrap_or("-"),
            t.category.as_deref().unwrap_or("uncategorized")
        );
    }
    println!(
        "\n{} transactions | income {} | spent {} | net {}",
        txns.len(),
        income,
        spent,
        income - spent
    );
    repo.close();
    Ok(())
}
