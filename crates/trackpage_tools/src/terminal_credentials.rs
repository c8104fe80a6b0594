#![forbid(unsafe_code)]

use std::io::{self, BufRead, IsTerminal, Write};

use trackpage_engines::credentials::{
    ChainedCredentialProvider, CredentialError, CredentialProvider, Credentials,
    EnvCredentialProvider,
};

/// Prompts on the controlling terminal. The password is read without echo; email and
/// MFA code are plain lines. Reports `Unavailable` when stdin is not a terminal so a
/// daemon never blocks on a prompt nobody will answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalCredentialProvider;

impl CredentialProvider for TerminalCredentialProvider {
    fn obtain_credentials(&self) -> Result<Credentials, CredentialError> {
        if !io::stdin().is_terminal() {
            return Err(CredentialError::Unavailable("interactive terminal"));
        }
        let email = prompt_line(
            "Connect email: ",
            &mut io::stdin().lock(),
            &mut io::stderr(),
        )?;
        let password = rpassword::prompt_password("Connect password: ")
            .map_err(|e| CredentialError::Input(e.to_string()))?;
        if password.is_empty() {
            return Err(CredentialError::Input("password must not be empty".to_string()));
        }
        Ok(Credentials { email, password })
    }

    fn obtain_mfa_code(&self) -> Result<String, CredentialError> {
        if !io::stdin().is_terminal() {
            return Err(CredentialError::Unavailable("interactive terminal"));
        }
        prompt_line("MFA code: ", &mut io::stdin().lock(), &mut io::stderr())
    }
}

/// Env first, then the terminal.
pub fn default_credential_provider() -> ChainedCredentialProvider {
    ChainedCredentialProvider::new(vec![
        Box::new(EnvCredentialProvider),
        Box::new(TerminalCredentialProvider),
    ])
}

fn prompt_line(
    prompt: &str,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<String, CredentialError> {
    output
        .write_all(prompt.as_bytes())
        .and_then(|_| output.flush())
        .map_err(|e| CredentialError::Input(e.to_string()))?;
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .map_err(|e| CredentialError::Input(e.to_string()))?;
    if read == 0 {
        return Err(CredentialError::Input("input closed".to_string()));
    }
    let value = line.trim().to_string();
    if value.is_empty() {
        return Err(CredentialError::Input(format!(
            "{} must not be empty",
            prompt.trim_end_matches([':', ' '])
        )));
    }
    Ok(value)
}
