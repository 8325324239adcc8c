//! Access to the database server the agent sits next to.
//!
//! Vendor mechanics live behind [`DatabaseServer`]. [`CommandDatabaseServer`] drives
//! operator-configured command lines; the connection string is handed to the child process in
//! the `STRATA_CONNECTION_STRING` environment variable so it never shows in a process listing.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use strata_core::models::{BackupType, Database, DatabaseConnection};
use strata_core::secrets::Cipher;

use crate::executor::{render_template, TaskContext, TaskError};

pub const CONNECTION_STRING_ENV: &str = "STRATA_CONNECTION_STRING";

/// Decrypt the password and substitute it into the connection string.
pub fn resolve_connection(
    cipher: &Cipher,
    connection: &DatabaseConnection,
) -> Result<SecretString, TaskError> {
    match connection.connection_string_password.as_deref() {
        Some(encrypted) if !encrypted.is_empty() => {
            let password = cipher.decrypt(encrypted)?;
            Ok(SecretString::from(
                connection
                    .connection_string
                    .replace("{password}", password.expose_secret()),
            ))
        }
        _ => Ok(SecretString::from(connection.connection_string.clone())),
    }
}

pub struct BackupRequest<'a> {
    pub connection: &'a SecretString,
    pub database: &'a str,
    pub backup_type: BackupType,
    pub destination: &'a Path,
}

#[async_trait]
pub trait DatabaseServer: Send + Sync {
    async fn test_connection(&self, connection: &SecretString) -> Result<(), TaskError>;

    async fn list_databases(&self, connection: &SecretString) -> Result<Vec<Database>, TaskError>;

    /// Write a backup of one database to `request.destination`, reporting progress on `ctx`.
    async fn backup(&self, request: BackupRequest<'_>, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// Command lines used by [`CommandDatabaseServer`]. Each is a program followed by its arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseCommands {
    /// Exit status 0 means the connection works.
    pub test: Vec<String>,
    /// Prints a JSON array of `{ databaseName, isSystem, hasAccess }` on stdout.
    pub list: Vec<String>,
    /// Tokens: `{database}`, `{destination}`, `{backupType}`. Each stdout line is a progress message.
    pub backup: Vec<String>,
}

pub struct CommandDatabaseServer {
    commands: DatabaseCommands,
}

impl CommandDatabaseServer {
    pub fn new(commands: DatabaseCommands) -> Self {
        Self { commands }
    }

    fn command(
        &self,
        argv: &[String],
        name: &str,
        tokens: &[(&str, &str)],
        connection: &SecretString,
    ) -> Result<Command, TaskError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(TaskError::InvalidSettings(format!(
                "database.{name} command is not configured"
            )));
        };
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| render_template(a, tokens)))
            .env(CONNECTION_STRING_ENV, connection.expose_secret())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn output(
        &self,
        argv: &[String],
        name: &str,
        connection: &SecretString,
    ) -> Result<String, TaskError> {
        let output = self.command(argv, name, &[], connection)?.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskError::Command(format!(
                "{name} command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DatabaseServer for CommandDatabaseServer {
    async fn test_connection(&self, connection: &SecretString) -> Result<(), TaskError> {
        let _ = self.output(&self.commands.test, "test", connection).await?;
        Ok(())
    }

    async fn list_databases(&self, connection: &SecretString) -> Result<Vec<Database>, TaskError> {
        let stdout = self.output(&self.commands.list, "list", connection).await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| TaskError::Command(format!("list command printed invalid JSON: {e}")))
    }

    async fn backup(&self, request: BackupRequest<'_>, ctx: &TaskContext) -> Result<(), TaskError> {
        let destination = request.destination.to_string_lossy();
        let tokens = [
            ("database", request.database),
            ("destination", destination.as_ref()),
            ("backupType", request.backup_type.as_str()),
        ];
        let mut child = self
            .command(&self.commands.backup, "backup", &tokens, request.connection)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Command("backup command has no stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::Command("backup command has no stderr".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!(database = request.database, "killing backup command");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill backup command");
                    }
                    let _ = tokio::fs::remove_file(request.destination).await;
                    return Err(TaskError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) if !line.trim().is_empty() => ctx.progress(line.trim()).await,
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(request.destination).await;
                return Err(TaskError::Cancelled);
            }
            status = child.wait() => status?,
        };
        if !status.success() {
            let mut message = String::new();
            let _ = stderr.read_to_string(&mut message).await;
            return Err(TaskError::Command(format!(
                "backup command exited with {status}: {}",
                message.trim()
            )));
        }
        Ok(())
    }
}
