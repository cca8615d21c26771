use super::error::{io_error, McpError};
use crate::config::McpServerConfig;
use crate::shared::logging::LogSink;
use std::io::{BufRead, BufReader};
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::thread;

/// Pipes of a spawned server plus the teardown that kills it.
pub struct StdioTransport {
    pub stdout: ChildStdout,
    pub stdin: ChildStdin,
    pub closer: Box<dyn FnOnce() + Send>,
}

/// Launches the server with piped stdio. Stderr lines go to the log.
pub fn spawn_stdio(
    server: &str,
    config: &McpServerConfig,
    log: &LogSink,
) -> Result<StdioTransport, McpError> {
    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = config.cwd.as_ref() {
        command.current_dir(cwd);
    }
    for (k, v) in &config.env {
        command.env(k, v);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(McpError::MissingBinary {
                binary: config.command.clone(),
            })
        }
        Err(source) => {
            return Err(McpError::Spawn {
                command: config.command.clone(),
                source,
            })
        }
    };

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io_error(&config.command, std::io::Error::other("missing stdin pipe")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_error(&config.command, std::io::Error::other("missing stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_error(&config.command, std::io::Error::other("missing stderr pipe")))?;

    let stderr_log = log.clone();
    let stderr_server = server.to_string();
    thread::Builder::new()
        .name(format!("mcp-{server}-stderr"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else {
                    break;
                };
                stderr_log.info("mcp.stderr", &format!("server={stderr_server} {line}"));
            }
        })
        .map_err(|err| io_error(&config.command, err))?;

    log.info(
        "mcp.spawn",
        &format!("server={server} command={} pid={}", config.command, child.id()),
    );
    Ok(StdioTransport {
        stdout,
        stdin,
        closer: Box::new(move || {
            let _ = child.kill();
            let _ = child.wait();
        }),
    })
}
