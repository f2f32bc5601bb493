use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use clap::Parser;
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use shardis_server::protocol::{Reply, RespParser, to_cmdline};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "shardis-cli")]
#[command(about = "Shardis CLI - Redis-compatible command-line client", long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'h', long, default_value = "127.0.0.1")]
    host: String,

    /// Server RESP port
    #[arg(short = 'p', long, default_value = "6399")]
    port: u16,

    /// Password sent with AUTH after connecting
    #[arg(short = 'a', long)]
    password: Option<String>,

    /// HTTP address (host:port) for `INFO` and `CLUSTER INFO`
    #[arg(long)]
    http: Option<String>,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct ShardisClient {
    stream: TcpStream,
    buf: BytesMut,
    http: Option<String>,
    client: reqwest::Client,
}

impl ShardisClient {
    async fn connect(host: &str, port: u16, http: Option<String>) -> Result<Self> {
        let stream = tokio::time::timeout(
            Duration::from_secs(5),
            TcpStream::connect((host, port)),
        )
        .await
        .context("connect timed out")?
        .with_context(|| format!("could not connect to {}:{}", host, port))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            http,
            client: reqwest::Client::new(),
        })
    }

    /// Send one command line and wait for its reply
    async fn call(&mut self, args: &[String]) -> Result<Reply> {
        let cmd = Reply::from_cmdline(&to_cmdline(args.iter().map(String::as_str)));
        self.stream.write_all(&cmd.to_bytes()).await?;

        loop {
            if let Some(reply) = RespParser::parse(&mut self.buf)? {
                return Ok(reply);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                bail!("server closed the connection");
            }
        }
    }

    async fn execute_command(&mut self, args: &[String]) -> Result<String> {
        let start = Instant::now();
        let name = args[0].to_uppercase();
        let sub = args.get(1).map(|s| s.to_uppercase());

        let response = match (name.as_str(), sub.as_deref()) {
            ("HELP", _) => help_text(),
            ("INFO", None) => self.http_get("/kv/stats").await?,
            ("CLUSTER", Some("INFO")) => self.http_get("/cluster").await?,
            _ => format_reply(&self.call(args).await?, 0),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn http_get(&self, path: &str) -> Result<String> {
        let base = self
            .http
            .as_deref()
            .ok_or_else(|| anyhow!("start the CLI with --http <host:port> to use this command"))?;
        let res = self
            .client
            .get(format!("http://{}{}", base, path))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;
        Ok(serde_json::to_string_pretty(&res)?)
    }
}

/// redis-cli style rendering
fn format_reply(reply: &Reply, indent: usize) -> String {
    match reply {
        Reply::Status(s) => s.green().to_string(),
        Reply::Error(e) => format!("(error) {}", e).red().to_string(),
        Reply::Integer(n) => format!("(integer) {}", n),
        Reply::Bulk(b) => {
            let text = String::from_utf8_lossy(b);
            if text.contains('\n') {
                text.into_owned()
            } else {
                format!("\"{}\"", text)
            }
        }
        Reply::Null => "(nil)".dimmed().to_string(),
        Reply::Array(items) if items.is_empty() => "(empty array)".dimmed().to_string(),
        Reply::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let pad = if i == 0 { String::new() } else { " ".repeat(indent) };
                let prefix = format!("{}) ", i + 1);
                let inner = format_reply(item, indent + prefix.len());
                format!("{}{}{}", pad, prefix, inner)
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Split a line on whitespace, honoring double and single quotes
fn split_args(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_arg = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some('n') => current.push('\n'),
                Some('t') => current.push('\t'),
                Some(other) => current.push(other),
                None => bail!("unbalanced quotes"),
            },
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if quote.is_some() {
        bail!("unbalanced quotes");
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

fn help_text() -> String {
    format!(
        r#"{}

Any command is sent to the server as-is, e.g.:
  SET key value [EX s|PX ms|NX|XX]
  GET key / MGET key [key ...] / MSET k1 v1 [k2 v2 ...]
  DEL key [key ...] / EXISTS key [key ...]
  RENAME src dst / COPY src dst [REPLACE]
  EXPIRE key seconds / PTTL key / PERSIST key
  cluster.nodes              Show nodes, roles and slot ranges

{}
  INFO                       Store statistics (needs --http)
  CLUSTER INFO               Raft status, migrations, failovers (needs --http)
  HELP                       Show this help message
  QUIT                       Exit the CLI
"#,
        "Shardis CLI".bold().cyan(),
        "Client Commands:".bold(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_level(false)
        .without_time()
        .init();

    let args = Args::parse();
    let mut client = ShardisClient::connect(&args.host, args.port, args.http.clone()).await?;

    if let Some(password) = &args.password {
        let reply = client
            .call(&["AUTH".to_string(), password.clone()])
            .await?;
        if let Reply::Error(e) = reply {
            bail!("authentication failed: {}", e);
        }
    }

    if !args.command.is_empty() {
        match client.execute_command(&args.command).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(client, &args.host, args.port).await
    }
}

async fn run_interactive(mut client: ShardisClient, host: &str, port: u16) -> Result<()> {
    info!(
        "{}",
        format!("Shardis CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Connected to {}:{}", host, port);
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("{}:{}", host, port).green());
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                rl.add_history_entry(&line)?;

                let parts = match split_args(&line) {
                    Ok(parts) if !parts.is_empty() => parts,
                    Ok(_) => continue,
                    Err(e) => {
                        error!("{}", format!("Error: {}", e).red());
                        continue;
                    }
                };

                let cmd = parts[0].to_uppercase();
                if cmd == "QUIT" || cmd == "EXIT" {
                    info!("Goodbye!");
                    break;
                }

                match client.execute_command(&parts).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_args_quotes() {
        assert_eq!(
            split_args(r#"SET "my key" 'a b' plain"#).unwrap(),
            vec!["SET", "my key", "a b", "plain"]
        );
        assert_eq!(split_args(r#"SET k "line\nbreak""#).unwrap()[2], "line\nbreak");
        assert_eq!(split_args(r#"SET k """#).unwrap(), vec!["SET", "k", ""]);
        assert!(split_args(r#"GET "open"#).is_err());
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn test_format_nested_array() {
        colored::control::set_override(false);
        let reply = Reply::Array(vec![
            Reply::bulk("a"),
            Reply::Array(vec![Reply::Integer(1), Reply::Null]),
        ]);
        assert_eq!(
            format_reply(&reply, 0),
            "1) \"a\"\n2) 1) (integer) 1\n   2) (nil)"
        );
    }
}
