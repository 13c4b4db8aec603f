//! `accounts` subcommands: add, list, remove, verify.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use multiclaude_core::AccountPool;
use multiclaude_types::{Account, AccountSource, Provider};

#[derive(Subcommand)]
pub enum AccountsCommand {
    /// Add an account to the pool.
    Add {
        /// Provider: antigravity, zai, or copilot.
        #[arg(long)]
        provider: Provider,
        /// Account email (identity).
        #[arg(long)]
        email: String,
        /// API key (manual accounts, e.g. z.ai).
        #[arg(long)]
        api_key: Option<String>,
        /// OAuth refresh token (antigravity accounts).
        #[arg(long)]
        refresh_token: Option<String>,
        /// Google Cloud project id (antigravity, optional).
        #[arg(long)]
        project_id: Option<String>,
        /// Enroll a copilot account via the GitHub device-code flow.
        #[arg(long)]
        device_login: bool,
    },
    /// List pooled accounts.
    List,
    /// Remove an account by email.
    Remove { email: String },
    /// Check that every account's credential still works.
    Verify,
}

pub async fn run(command: AccountsCommand) -> Result<()> {
    let http = reqwest::Client::new();
    let path = multiclaude_core::config::accounts_config_path();
    let pool = AccountPool::load(path, http.clone());

    match command {
        AccountsCommand::Add {
            provider,
            email,
            api_key,
            refresh_token,
            project_id,
            device_login,
        } => {
            let mut account = match provider {
                Provider::Zai => {
                    let key = api_key.context("z.ai accounts require --api-key")?;
                    let mut account = Account::new(&email, provider, AccountSource::Manual);
                    account.api_key = Some(key);
                    account
                }
                Provider::Antigravity => {
                    let token = refresh_token
                        .context("antigravity accounts require --refresh-token")?;
                    let mut account = Account::new(&email, provider, AccountSource::Oauth);
                    account.refresh_token = Some(token);
                    account
                }
                Provider::Copilot => {
                    let token = match refresh_token {
                        Some(t) => t,
                        None if device_login => device_code_login(&http).await?,
                        None => bail!(
                            "copilot accounts require --refresh-token or --device-login"
                        ),
                    };
                    let mut account = Account::new(&email, provider, AccountSource::Oauth);
                    account.refresh_token = Some(token);
                    account
                }
            };
            account.project_id = project_id;

            pool.add_account(account)?;
            println!("{} Added {} ({})", "✓".green(), email.bold(), provider);
            Ok(())
        }

        AccountsCommand::List => {
            let accounts = pool.list_accounts();
            if accounts.is_empty() {
                println!("No accounts configured.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec![
                "Email",
                "Provider",
                "Source",
                "Status",
                "Last used",
            ]);
            for account in accounts {
                let status = if account.is_invalid {
                    format!(
                        "invalid: {}",
                        account.invalid_reason.as_deref().unwrap_or("unknown")
                    )
                } else {
                    "ok".to_string()
                };
                table.add_row(vec![
                    account.email.clone(),
                    account.provider.to_string(),
                    format!("{:?}", account.source).to_lowercase(),
                    status,
                    format_timestamp(account.last_used),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        AccountsCommand::Remove { email } => {
            let removed = pool.remove_account(&email)?;
            println!("{} Removed {} ({})", "✓".green(), removed.email.bold(), removed.provider);
            Ok(())
        }

        AccountsCommand::Verify => {
            let accounts = pool.list_accounts();
            if accounts.is_empty() {
                println!("No accounts configured.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec!["Email", "Provider", "Credential"]);
            let mut failures = 0;
            for account in &accounts {
                let result = pool.get_token(account).await;
                let status = match &result {
                    Ok(_) => "ok".green().to_string(),
                    Err(e) => {
                        failures += 1;
                        format!("{}", e).red().to_string()
                    }
                };
                table.add_row(vec![
                    account.email.clone(),
                    account.provider.to_string(),
                    status,
                ]);
            }
            println!("{table}");

            if failures > 0 {
                bail!("{failures} account(s) failed verification");
            }
            Ok(())
        }
    }
}

async fn device_code_login(http: &reqwest::Client) -> Result<String> {
    use multiclaude_core::providers::copilot::auth;

    let device = auth::request_device_code(http).await?;
    println!(
        "Open {} and enter code {}",
        device.verification_uri.bold(),
        device.user_code.bold().cyan()
    );
    println!("Waiting for approval...");
    let token = auth::poll_for_access_token(http, &device).await?;
    println!("{} Device authorized", "✓".green());
    Ok(token)
}

fn format_timestamp(ms: i64) -> String {
    if ms <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}
