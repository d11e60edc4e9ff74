//! # uploader - a tether example which uploads files through a modem
//!
//! Talks to the modem through a TCP serial bridge on localhost. Every file
//! found in the watch directory is POSTed to the server and deleted once the
//! server accepts it. Modem settings come from `TETHER_*` variables.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

extern crate env_logger;
#[macro_use]
extern crate log;
#[macro_use]
extern crate tether;
extern crate tether_hayes as hayes;
extern crate tether_modem as modem;

use std::collections::HashMap;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use hayes::stream::StreamDevice;
use modem::{Body, Config, FsStorage, HttpRequest, Method, NoPins, StorageBus};
use tether::timer::SystemClock;
use tether::Context;

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

#[derive(Clone)]
struct Handle(mpsc::Sender<Incoming>);

app_map! {
	generate: Incoming,
	handle: Handle,
	used: {
		modem: (Service, ModemCfm, ModemInd)
	}
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const SCAN_INTERVAL: Duration = Duration::from_secs(30);
const BRIDGE_ADDR: &str = "127.0.0.1:7000";
const WATCH_DIR: &str = "/var/spool/tether";
const SERVER_HOST: &str = "upload.example.com";

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

/// Start of our example program
fn main() {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let watch = PathBuf::from(WATCH_DIR);
	let host = SERVER_HOST;

	let config = Config::from_env();
	info!("Hello, this is the tether uploader.");
	info!("Watching {} for {} via {:?}", watch.display(), host, config);

	let stream = match TcpStream::connect(BRIDGE_ADDR) {
		Ok(stream) => stream,
		Err(e) => {
			error!("Can't reach serial bridge at {}: {}", BRIDGE_ADDR, e);
			return;
		}
	};
	if let Err(e) = stream.set_nonblocking(true) {
		error!("Can't make the bridge non-blocking: {}", e);
		return;
	}

	let bus = StorageBus::new();
	let modem_thread = modem::make_task(
		config,
		StreamDevice::new(stream),
		SystemClock::new(),
		FsStorage::new(bus),
		NoPins,
	);

	let (tx, rx) = mpsc::channel();
	let handle = Handle(tx);
	let mut n = Context::default();
	let mut pending: HashMap<Context, PathBuf> = HashMap::new();
	let mut next_scan = Instant::now();

	loop {
		if Instant::now() >= next_scan {
			next_scan = Instant::now() + SCAN_INTERVAL;
			for path in scan(&watch) {
				if pending.values().any(|p| *p == path) {
					continue;
				}
				let ctx = n.take();
				if modem_thread.submit(ctx, upload(host, &path), &handle) {
					pending.insert(ctx, path);
				}
			}
		}
		let wait = next_scan.saturating_duration_since(Instant::now());
		match rx.recv_timeout(wait) {
			Ok(Incoming::ModemCfm(modem::Confirm::Submit(cfm))) => {
				let path = match pending.remove(&cfm.context) {
					Some(path) => path,
					None => continue,
				};
				if cfm.response.status.is_success() {
					info!("Uploaded {} ({})", path.display(), cfm.response.status);
					if let Err(e) = fs::remove_file(&path) {
						warn!("Can't remove {}: {}", path.display(), e);
					}
				} else {
					warn!("Server refused {}: {}", path.display(), cfm.response.status);
				}
			}
			Ok(Incoming::ModemCfm(cfm)) => debug!("Got {:?}", cfm),
			Ok(Incoming::ModemInd(ind)) => match ind {},
			Err(mpsc::RecvTimeoutError::Timeout) => {}
			Err(mpsc::RecvTimeoutError::Disconnected) => break,
		}
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

fn scan(dir: &Path) -> Vec<PathBuf> {
	match fs::read_dir(dir) {
		Ok(entries) => entries
			.filter_map(|e| e.ok())
			.map(|e| e.path())
			.filter(|p| p.is_file())
			.collect(),
		Err(e) => {
			warn!("Can't scan {}: {}", dir.display(), e);
			Vec::new()
		}
	}
}

fn upload(host: &str, path: &Path) -> HttpRequest {
	let name = path
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default();
	HttpRequest::new(Method::POST, host, &format!("/data?file={}", name)).with_body(
		modem::CONTENT_TYPE_OCTET_STREAM,
		Body::File(path.to_owned()),
	)
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
