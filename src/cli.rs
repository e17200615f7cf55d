use std::path::{Path, PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::wrappers::LinesStream;

use crate::config::{AppConfig, ClientConfig, ServerConfig};
use crate::error::Result;
use crate::presence::Tab;

#[derive(Parser, Debug)]
#[command(name = "wolf-collab")]
#[command(version)]
#[command(about = "Real-time collaboration relay and presence watcher")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Connect to a relay and show live presence, activity and chat
    Watch(WatchArgs),
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind (overrides the config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (overrides the config file)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Seconds between roster broadcasts; 0 disables them
    #[arg(long)]
    pub roster_interval: Option<u64>,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl ServeArgs {
    /// File config (or defaults) with flags layered on top.
    pub fn resolve(&self) -> Result<ServerConfig> {
        let mut server = load_config(self.config.as_deref())?.server;
        if let Some(host) = &self.host {
            server.host = host.clone();
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(secs) = self.roster_interval {
            server.roster_interval_secs = secs;
        }
        Ok(server)
    }
}

#[derive(ClapArgs, Debug, Default)]
pub struct WatchArgs {
    /// Relay endpoint, ws:// or wss://
    #[arg(long, short)]
    pub url: Option<String>,

    /// Display name announced to the relay
    #[arg(long, short)]
    pub name: Option<String>,

    /// Stable user id; the relay assigns one if omitted
    #[arg(long)]
    pub id: Option<String>,

    /// Tab shown at start
    #[arg(long, short, value_enum, default_value_t = Tab::Activity)]
    pub tab: Tab,

    /// Start in simulation mode with canned collaborators
    #[arg(long)]
    pub simulate: bool,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl WatchArgs {
    /// File config (or defaults) with the endpoint and identity applied.
    pub fn resolve(&self) -> Result<ClientConfig> {
        let mut client = load_config(self.config.as_deref())?.client;
        if let Some(url) = &self.url {
            client.url = url.clone();
        }
        let mut params = Vec::new();
        if let Some(name) = &self.name {
            params.push(("name", name.as_str()));
        }
        if let Some(id) = &self.id {
            params.push(("id", id.as_str()));
        }
        client.url = with_query(&client.url, &params);
        Ok(client)
    }
}

/// Load `path` if given, otherwise defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(p) => AppConfig::load(p),
        None => Ok(AppConfig::default()),
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Append query parameters to `url`.
pub fn with_query(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", encode_component(v)))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{query}")
}

/// Line stream over interactive input for `watch`.
pub fn input_lines<R: AsyncBufRead>(reader: R) -> LinesStream<R> {
    LinesStream::new(reader.lines())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn serve_args(argv: &[&str]) -> ServeArgs {
        match Args::parse_from(argv).command {
            Command::Serve(a) => a,
            other => panic!("expected serve, got {other:?}"),
        }
    }

    fn watch_args(argv: &[&str]) -> WatchArgs {
        match Args::parse_from(argv).command {
            Command::Watch(a) => a,
            other => panic!("expected watch, got {other:?}"),
        }
    }

    #[test]
    fn test_serve_defaults() {
        let args = serve_args(&["wc", "serve"]);
        assert!(args.host.is_none());
        assert!(args.port.is_none());
        let server = args.resolve().unwrap();
        assert_eq!(server.port, 8080);
        assert_eq!(server.host, "127.0.0.1");
    }

    #[test]
    fn test_serve_flags_override() {
        let args = serve_args(&[
            "wc",
            "serve",
            "--host",
            "0.0.0.0",
            "-p",
            "9000",
            "--roster-interval",
            "0",
        ]);
        let server = args.resolve().unwrap();
        assert_eq!(server.bind_address(), "0.0.0.0:9000");
        assert!(server.roster_interval().is_none());
    }

    #[test]
    fn test_serve_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 7000\nhost = \"10.0.0.1\"").unwrap();
        let path = file.path().to_str().unwrap();
        let args = serve_args(&["wc", "serve", "--config", path, "--port", "7001"]);
        let server = args.resolve().unwrap();
        assert_eq!(server.host, "10.0.0.1");
        assert_eq!(server.port, 7001);
    }

    #[test]
    fn test_watch_defaults() {
        let args = watch_args(&["wc", "watch"]);
        assert_eq!(args.tab, Tab::Activity);
        assert!(!args.simulate);
        let client = args.resolve().unwrap();
        assert_eq!(client.url, "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn test_watch_full() {
        let args = watch_args(&[
            "wc",
            "watch",
            "--url",
            "wss://collab.example.com/ws",
            "--name",
            "Ann Lee",
            "--id",
            "u1",
            "--tab",
            "chat",
            "--simulate",
        ]);
        assert_eq!(args.tab, Tab::Chat);
        assert!(args.simulate);
        let client = args.resolve().unwrap();
        assert_eq!(client.url, "wss://collab.example.com/ws?name=Ann%20Lee&id=u1");
    }

    #[test]
    fn test_watch_rejects_unknown_tab() {
        assert!(Args::try_parse_from(["wc", "watch", "--tab", "files"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Args::try_parse_from(["wc"]).is_err());
    }

    #[test]
    fn test_with_query_appends_to_existing() {
        assert_eq!(with_query("ws://h/ws?a=1", &[("b", "x y")]), "ws://h/ws?a=1&b=x%20y");
        assert_eq!(with_query("ws://h/ws", &[]), "ws://h/ws");
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("Jürgen & co"), "J%C3%BCrgen%20%26%20co");
        assert_eq!(encode_component("a-b_c.d~e"), "a-b_c.d~e");
    }

    #[tokio::test]
    async fn test_input_lines_splits_commands() {
        use tokio_stream::StreamExt;
        let input: &[u8] = b"/tab users\r\nhello there\n/quit";
        let lines: Vec<String> = input_lines(input)
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["/tab users", "hello there", "/quit"]);
    }
}
