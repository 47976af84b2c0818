use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use gistvault_core::totp::OtpAuthUri;
use gistvault_core::{
    platform, AccountDraft, AccountStore, GistClient, KeyRing, KeyValueStore, PinGate, PinState,
    SqliteStore, SyncOrchestrator, SyncSession, VaultConfig, VaultError, VerifyOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// GistVault - encrypted one-time codes and passwords, backed up to a private Gist
#[derive(Parser)]
#[command(name = "gistvault", version)]
#[command(about = "Encrypted secrets vault with Gist backup", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the local store
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// GitHub access token used for the Gist API and key derivation
    #[arg(long, env = "GISTVAULT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add an account
    Add {
        /// Display name
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        username: String,

        /// Password (will prompt if not provided)
        #[arg(long)]
        password: Option<String>,

        /// otpauth:// URI for one-time codes
        #[arg(long)]
        otp_uri: Option<String>,

        #[arg(long, default_value = "")]
        notes: String,

        #[arg(long)]
        favorite: bool,
    },

    /// List accounts
    List,

    /// Show one account
    Show {
        /// Account key or name
        account: String,

        /// Print secret fields in plain text
        #[arg(long)]
        reveal: bool,
    },

    /// Print the current one-time code for an account
    Code {
        /// Account key or name
        account: String,
    },

    /// Mark an account as favorite
    Favorite {
        /// Account key or name
        account: String,

        /// Clear the flag instead
        #[arg(long)]
        off: bool,
    },

    /// Remove an account
    Remove {
        /// Account key or name
        account: String,
    },

    /// Push an encrypted backup to the remote Gist
    Backup,

    /// Replace local accounts with the remote backup
    Restore {
        /// Restore this Gist instead of the located one
        #[arg(long)]
        id: Option<String>,
    },

    /// Show recent backups
    History,

    /// Show sync state
    Status,

    /// Poll for remote changes until interrupted
    Watch,

    /// Manage the app PIN
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Check the account index against stored records
    Check {
        /// Fix any problems found
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Subcommand)]
enum PinAction {
    /// Set a PIN
    Set,
    /// Change the PIN
    Change,
    /// Remove the PIN
    Remove,
    /// Check a PIN
    Verify,
}

struct App {
    config: VaultConfig,
    store: Arc<dyn KeyValueStore>,
    keys: KeyRing,
    accounts: Arc<AccountStore>,
    token: Option<String>,
}

impl App {
    async fn open(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(platform::get_default_config_path);
        let config = VaultConfig::load_or_default(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;

        let store_path = match &cli.data_dir {
            Some(dir) => dir.join("vault.db"),
            None => platform::get_default_store_path(),
        };
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&store_path)?);

        let token = cli
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if token.is_none() {
            warn!("No access token; using a device-local key that cannot restore elsewhere");
        }

        let keys = KeyRing::load(store.as_ref(), token.as_deref()).await?;
        let accounts = Arc::new(
            AccountStore::new(store.clone(), keys.field.clone())
                .with_token_threshold(config.token_threshold),
        );

        Ok(Self {
            config,
            store,
            keys,
            accounts,
            token,
        })
    }

    fn session(&self) -> Result<SyncSession> {
        let Some(token) = &self.token else {
            bail!("No access token; pass --token or set GISTVAULT_TOKEN");
        };
        let remote = Arc::new(GistClient::new(&self.config.sync.api_base_url, token)?);
        let orchestrator = SyncOrchestrator::new(
            self.accounts.clone(),
            remote,
            self.keys.clone(),
            self.config.sync.clone(),
        );
        Ok(SyncSession::new(Arc::new(orchestrator)))
    }

    async fn pin_gate(&self) -> Result<PinGate> {
        Ok(PinGate::load(self.store.clone(), self.config.lockout, self.config.pin_kdf).await?)
    }

    /// Ask for the PIN when one is configured.
    async fn unlock(&self) -> Result<()> {
        let mut gate = self.pin_gate().await?;
        loop {
            match gate.state() {
                PinState::NoPin | PinState::Unlocked => return Ok(()),
                PinState::LockedOut { until } => {
                    bail!("Too many wrong PINs; try again after {}", until.with_timezone(&Local))
                }
                PinState::Locked => {}
            }
            let pin = rpassword::prompt_password("PIN: ")?;
            report_verify(gate.verify(&pin)?);
        }
    }

    /// Resolve an account by key, or by unique case-insensitive name.
    async fn find_account(&self, selector: &str) -> Result<String> {
        let accounts = self.accounts.list().await?;
        if accounts.iter().any(|a| a.key == selector) {
            return Ok(selector.to_string());
        }

        let matches: Vec<_> = accounts
            .iter()
            .filter(|a| a.record.account_name.eq_ignore_ascii_case(selector))
            .collect();
        match matches.as_slice() {
            [one] => Ok(one.key.clone()),
            [] => bail!("No account matches '{}'", selector),
            _ => bail!("'{}' matches several accounts; use the key instead", selector),
        }
    }
}

fn report_verify(outcome: VerifyOutcome) {
    match outcome {
        VerifyOutcome::Unlocked => println!("PIN accepted"),
        VerifyOutcome::Rejected {
            locked_out_until: Some(until),
            ..
        } => println!(
            "Wrong PIN. Locked out until {}",
            until.with_timezone(&Local).format("%H:%M:%S")
        ),
        VerifyOutcome::Rejected {
            attempts_remaining, ..
        } => println!("Wrong PIN. {} attempts remaining", attempts_remaining),
    }
}

fn prompt_new_pin() -> Result<String> {
    let pin = rpassword::prompt_password("New PIN: ")?;
    let confirm = rpassword::prompt_password("Confirm PIN: ")?;
    if pin != confirm {
        bail!("PINs do not match");
    }
    Ok(pin)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::open(&cli).await?;

    match cli.command {
        Commands::Add {
            name,
            username,
            password,
            otp_uri,
            notes,
            favorite,
        } => {
            let password = match password {
                Some(p) => p,
                None => rpassword::prompt_password("Password (empty for none): ")?,
            };
            if let Some(uri) = &otp_uri {
                OtpAuthUri::parse(uri)?;
            }
            let key = app
                .accounts
                .add(&AccountDraft {
                    account_name: name,
                    username,
                    password,
                    otp_uri: otp_uri.unwrap_or_default(),
                    notes,
                    is_favorite: favorite,
                })
                .await?;
            println!("Added {}", key);
        }
        Commands::List => {
            let accounts = app.accounts.list().await?;
            if accounts.is_empty() {
                println!("No accounts");
            }
            for account in accounts {
                let record = account.record;
                println!(
                    "{}{}  {}  {}{}",
                    if record.is_favorite { "* " } else { "  " },
                    account.key,
                    record.account_name,
                    record.username,
                    if record.otp_uri.is_empty() { "" } else { "  [otp]" },
                );
            }
        }
        Commands::Show { account, reveal } => {
            let key = app.find_account(&account).await?;
            if reveal {
                app.unlock().await?;
            }
            let revealed = app.accounts.reveal(&key).await?;
            let hidden = |value: &str| {
                if value.is_empty() {
                    String::new()
                } else if reveal {
                    value.to_string()
                } else {
                    "********".to_string()
                }
            };
            println!("Key:       {}", revealed.key);
            println!("Name:      {}", revealed.account_name);
            println!("Username:  {}", revealed.username);
            println!("Password:  {}", hidden(&revealed.password));
            println!("OTP URI:   {}", hidden(&revealed.otp_uri));
            println!("Notes:     {}", revealed.notes);
            println!("Favorite:  {}", revealed.is_favorite);
            println!("Modified:  {}", revealed.modified_at.with_timezone(&Local));
        }
        Commands::Code { account } => {
            let key = app.find_account(&account).await?;
            app.unlock().await?;
            let revealed = app.accounts.reveal(&key).await?;
            if revealed.otp_uri.is_empty() {
                bail!("{} has no one-time code", revealed.account_name);
            }
            let uri = OtpAuthUri::parse(&revealed.otp_uri)?;
            let code = uri.code_at(Utc::now().timestamp())?;
            match code.seconds_remaining {
                Some(secs) => println!("{}  ({}s left)", code.code, secs),
                None => println!("{}  (counter {})", code.code, uri.counter),
            }
        }
        Commands::Favorite { account, off } => {
            let key = app.find_account(&account).await?;
            app.accounts.set_favorite(&key, !off).await?;
            println!("{} {}", if off { "Unstarred" } else { "Starred" }, key);
        }
        Commands::Remove { account } => {
            let key = app.find_account(&account).await?;
            app.accounts.remove(&key).await?;
            println!("Removed {}", key);
        }
        Commands::Backup => {
            let session = app.session()?;
            match session.backup_now().await {
                Ok(receipt) => {
                    println!(
                        "Backed up {} accounts to {}{}",
                        receipt.account_count,
                        receipt.remote_id,
                        if receipt.created { " (new gist)" } else { "" }
                    );
                    for key in &receipt.skipped {
                        println!("Skipped unreadable account {}", key);
                    }
                    if let Some(warning) = receipt.warning() {
                        println!("Warning: {}", warning);
                    }
                }
                Err(VaultError::NothingToExport) => println!("Nothing to back up"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Restore { id } => {
            app.unlock().await?;
            let session = app.session()?;
            let report = session.restore_now(id.as_deref()).await?;
            println!(
                "Restored {} accounts from {} (updated {})",
                report.account_count,
                report.remote_id,
                report.updated_at.with_timezone(&Local)
            );
        }
        Commands::History => {
            let session = app.session()?;
            let history = session.orchestrator().history().await?;
            if history.is_empty() {
                println!("No backups yet");
            }
            for entry in history {
                println!(
                    "{}  {}  {} accounts{}",
                    entry.backed_up_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    entry.remote_id,
                    entry.account_count,
                    if entry.created { "  (created)" } else { "" }
                );
            }
        }
        Commands::Status => {
            let session = app.session()?;
            let status = session.status().await?;
            let remote_at = session.orchestrator().remote_updated_at().await;
            println!("Remote gist:    {}", status.remote_id.as_deref().unwrap_or("-"));
            println!(
                "Last backup:    {}",
                status
                    .last_backup_at
                    .map(|t| t.with_timezone(&Local).to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            match remote_at {
                Ok(Some(t)) => println!("Remote updated: {}", t.with_timezone(&Local)),
                Ok(None) => println!("Remote updated: no backup found"),
                Err(e) => println!("Remote updated: unavailable ({})", e),
            }
            println!("Master key:     {:?}", status.master_key_source);
            if let Some(warning) = status.master_key_warning {
                println!("Warning: {}", warning);
            }
        }
        Commands::Watch => {
            let session = app.session()?;
            session.attach(&app.accounts);
            session.subscribe(Arc::new(|syncing: bool| {
                if syncing {
                    info!("Syncing");
                } else {
                    info!("Idle");
                }
            }));
            session.start_polling();
            tokio::signal::ctrl_c().await?;
            session.shutdown();
        }
        Commands::Pin { action } => {
            let mut gate = app.pin_gate().await?;
            match action {
                PinAction::Set => {
                    if gate.has_pin() {
                        bail!("A PIN is already set; use `pin change`");
                    }
                    gate.setup_pin(&prompt_new_pin()?).await?;
                    println!("PIN set");
                }
                PinAction::Change => {
                    if !gate.has_pin() {
                        bail!("No PIN is set");
                    }
                    let current = rpassword::prompt_password("Current PIN: ")?;
                    let new_pin = prompt_new_pin()?;
                    let outcome = gate.change_pin(&current, &new_pin).await?;
                    report_verify(outcome);
                    if outcome.is_unlocked() {
                        println!("PIN changed");
                    }
                }
                PinAction::Remove => {
                    if !gate.has_pin() {
                        bail!("No PIN is set");
                    }
                    let current = rpassword::prompt_password("Current PIN: ")?;
                    let outcome = gate.remove_pin(&current).await?;
                    report_verify(outcome);
                    if outcome.is_unlocked() {
                        println!("PIN removed");
                    }
                }
                PinAction::Verify => {
                    if !gate.has_pin() {
                        bail!("No PIN is set");
                    }
                    let pin = rpassword::prompt_password("PIN: ")?;
                    report_verify(gate.verify(&pin)?);
                }
            }
        }
        Commands::Check { repair } => {
            let report = if repair {
                app.accounts.repair().await?
            } else {
                app.accounts.check_integrity().await?
            };
            if report.is_clean() {
                println!("Account index is consistent");
            }
            for key in &report.orphans {
                println!("Orphaned index entry: {}", key);
            }
            for key in &report.leaks {
                println!("Unindexed record: {}", key);
            }
            for key in &report.duplicates {
                println!("Duplicate index entry: {}", key);
            }
            if repair && !report.is_clean() {
                println!("Repaired");
            }
        }
    }

    Ok(())
}
