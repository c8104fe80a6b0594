#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use trackpage_engines::connect_session::ConnectSessionBroker;
use trackpage_engines::session_vault::SessionVault;
use trackpage_tools::vault_cli::{execute_vault_command, require_key_id, VAULT_USAGE};
use trackpage_tools::{default_credential_provider, init_tracing};

const USAGE: &str = "usage: trackpage <vault|login> ...";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("vault") => run_vault(&args[1..]),
        Some("login") => run_login(),
        _ => Err(USAGE.to_string()),
    }
}

fn run_vault(args: &[String]) -> Result<(), String> {
    let subcommand = args
        .first()
        .ok_or_else(|| VAULT_USAGE.to_string())?
        .as_str();
    let key_id = args.get(1).map(String::as_str);
    let value = if subcommand == "set" {
        let key = require_key_id(key_id)?;
        Some(read_secret_value(key.as_str())?)
    } else {
        None
    };

    let vault = SessionVault::default_local();
    let output = execute_vault_command(&vault, subcommand, key_id, value.as_deref())?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

/// Establishes a Connect session up front so the server can start unattended from the
/// stored token.
fn run_login() -> Result<(), String> {
    init_tracing();
    let vault = SessionVault::default_local();
    let broker = ConnectSessionBroker::from_env(vault).map_err(|e| e.to_string())?;
    broker
        .establish(&default_credential_provider())
        .map_err(|e| format!("login failed: {e}"))?;
    println!("OK");
    Ok(())
}

fn read_secret_value(key_id: &str) -> Result<String, String> {
    let value = if io::stdin().is_terminal() {
        rpassword::prompt_password(format!("Enter value for {key_id}:"))
            .map_err(|e| e.to_string())?
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        input
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("secret value must not be empty".to_string());
    }
    Ok(trimmed.to_string())
}
