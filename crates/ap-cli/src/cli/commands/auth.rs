//! Login, logout and whoami.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Context, Result, bail};
use ap_core::config::Config;

use super::Backend;

pub async fn login(config: &Config, password: Option<String>) -> Result<()> {
    let backend = Backend::new(config)?;
    let password = match password {
        Some(p) => p,
        None => read_password()?,
    };
    if password.is_empty() {
        bail!("No master password provided");
    }

    let session = backend
        .auth
        .login(&backend.base_url, &password, &config.device_name)
        .await
        .context("Login failed")?;
    println!("Logged in as {} on {}", session.username, session.base_url);
    Ok(())
}

fn read_password() -> Result<String> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        eprint!("Master password: ");
        io::stderr().flush()?;
    }
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .context("read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn logout(config: &Config) -> Result<()> {
    let backend = Backend::new(config)?;
    // Best effort: a live session lets the server revoke the device too.
    backend.restore().await;
    backend.auth.logout(&backend.base_url).await;
    println!("Logged out.");
    Ok(())
}

pub async fn whoami(config: &Config) -> Result<()> {
    let backend = Backend::new(config)?;
    let session = backend.require_session().await?;
    println!(
        "{} ({}) on {}",
        session.username, session.device_name, session.base_url
    );
    Ok(())
}
