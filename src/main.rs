use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use offline_proxy::cache::SqliteStorage;
use offline_proxy::config::Config;
use offline_proxy::connectivity::Connectivity;
use offline_proxy::http::transport::ReqwestTransport;
use offline_proxy::http::{Method, Request, Response};
use offline_proxy::logging;
use offline_proxy::proxy::{ResponseProxy, Services};
use offline_proxy::refresh::{Refresh, RefreshState};

#[derive(Parser, Debug)]
#[command(name = "offline-proxy")]
#[command(about = "Offline-capable HTTP client with a local response cache and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-proxy/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the network as unreachable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send one request through the proxy
  Request {
    /// GET, HEAD, POST, PUT, PATCH, DELETE or OPTIONS
    method: String,
    url: String,
    /// Request header as NAME:VALUE (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Re-fetch a URL periodically, printing each result
  Watch {
    url: String,
    #[arg(long, default_value_t = 5)]
    interval_secs: u64,
    /// Stop after this many results
    #[arg(long)]
    count: Option<usize>,
  },
  /// List requests waiting to be replayed
  Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let connectivity = Connectivity::new(!(config.offline || args.offline));
  let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
  let services = Services::from_storage(transport, connectivity, storage);
  let proxy = Arc::new(ResponseProxy::new(services, config.proxy_options()));

  match args.command {
    Command::Request {
      method,
      url,
      headers,
      body,
    } => {
      let request = build_request(method.parse()?, url, &headers, body)?;
      let response = proxy.process_request(request).await?;
      print_response(&response);
    }
    Command::Watch {
      url,
      interval_secs,
      count,
    } => watch(proxy, url, Duration::from_secs(interval_secs), count).await,
    Command::Queue => {
      let pending = proxy.services().sync_queue.pending()?;
      if pending.is_empty() {
        println!("sync queue is empty");
      }
      for entry in pending {
        let stores = entry
          .undo_redo_data_array
          .as_ref()
          .map(|records| records.len())
          .unwrap_or(0);
        println!(
          "#{} {} {} {} (stores touched: {})",
          entry.id,
          entry.enqueued_at.to_rfc3339(),
          entry.request.method,
          entry.request.url,
          stores
        );
      }
    }
  }

  Ok(())
}

fn build_request(method: Method, url: String, headers: &[String], body: Option<String>) -> Result<Request> {
  let mut request = Request::new(method, url);
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header {:?}, expected NAME:VALUE", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(body) = body {
    serde_json::from_str::<serde_json::Value>(&body).map_err(|e| eyre!("Body is not valid JSON: {}", e))?;
    if !request.headers.contains("content-type") {
      request = request.with_header("content-type", "application/json");
    }
    request = request.with_body(body);
  }
  Ok(request)
}

fn print_response(response: &Response) {
  println!("{} {}", response.status, response.status_text);
  for (name, value) in response.headers.iter() {
    println!("{}: {}", name, value);
  }
  if !response.body.is_empty() {
    println!();
    println!("{}", response.text());
  }
}

async fn watch(proxy: Arc<ResponseProxy>, url: String, interval: Duration, count: Option<usize>) {
  let mut refresh = Refresh::for_request(proxy, Request::get(url));
  let mut ticker = tokio::time::interval(interval);
  let mut printed = 0;

  loop {
    ticker.tick().await;
    refresh.refresh();
    match refresh.settle().await {
      RefreshState::Success(response) => print_response(response),
      RefreshState::Error(e) => eprintln!("error: {}", e),
      RefreshState::Idle | RefreshState::Loading => continue,
    }
    printed += 1;
    if count.is_some_and(|limit| printed >= limit) {
      break;
    }
  }
}
