//! Sign-in, sign-out and service health commands

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::BufRead;
use sync_core::session::SessionError;

use crate::client::SyncClient;
use crate::output::{color_status, print_json, print_success, print_warning, OutputFormat};

/// Sign in and store the session for later commands
pub async fn login(
    client: &SyncClient,
    username: &str,
    password: Option<String>,
    push_token: Option<String>,
) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => read_password()?,
    };

    match client
        .auth()
        .login(username, &password, push_token.as_deref())
        .await
    {
        Ok(session) => {
            print_success(&format!("Signed in as {}", username.cyan()));
            if let Some(expiry) = session.expiry {
                println!("Session expires: {}", expiry);
            }
            Ok(())
        }
        Err(SessionError::Rejected(detail)) => {
            anyhow::bail!("Sign-in rejected: {}", detail)
        }
        Err(e) => Err(e).context("Sign-in failed"),
    }
}

fn read_password() -> Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    Ok(password)
}

/// Revoke the stored session
pub async fn logout(client: &SyncClient) -> Result<()> {
    if client.store().get().await.is_none() {
        print_warning("Not signed in");
        return Ok(());
    }
    client.auth().revoke().await.context("Failed to clear session")?;
    print_success("Signed out");
    Ok(())
}

/// Probe the collection service
pub async fn health(client: &SyncClient, format: OutputFormat) -> Result<()> {
    let health = client.transport().health().await;
    let signed_in = client.store().get().await.is_some();

    match format {
        OutputFormat::Json => {
            let mut value = serde_json::to_value(&health)?;
            value["signedIn"] = serde_json::json!(signed_in);
            print_json(&value)?;
        }
        OutputFormat::Table => {
            println!("{}", "Service Health".bold());
            println!("{}", "=".repeat(40));
            println!("Base URL:   {}", client.transport().base_url().as_str().cyan());
            println!("API:        {}", color_status(up_down(health.api)));
            println!("Ingest:     {}", color_status(up_down(health.ingest)));
            println!(
                "Session:    {}",
                if signed_in {
                    "signed in".green().to_string()
                } else {
                    "signed out".yellow().to_string()
                }
            );
        }
    }

    if !health.api {
        anyhow::bail!("Collection service is unreachable");
    }
    Ok(())
}

fn up_down(up: bool) -> &'static str {
    if up {
        "up"
    } else {
        "down"
    }
}
