use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;

use janus::config::{self, CliOptions, DanglingPolicy, Role};
use janus::logging::*;
use janus::{client, keygen, server, JanusError};

fn build_cli() -> Command {
	Command::new("janus")
		.version(env!("CARGO_PKG_VERSION"))
		.about("High-throughput one-way directory synchroniser")
		.arg(
			Arg::new("server")
				.long("server")
				.action(ArgAction::SetTrue)
				.conflicts_with("client")
				.help("Run as the receiving server"),
		)
		.arg(
			Arg::new("client")
				.long("client")
				.action(ArgAction::SetTrue)
				.help("Run as the pushing client"),
		)
		.arg(
			Arg::new("host")
				.long("host")
				.visible_alias("ip")
				.value_name("ADDR")
				.help("Address to bind (server) or connect to (client)"),
		)
		.arg(Arg::new("port").long("port").value_name("PORT").help("TCP port"))
		.arg(
			Arg::new("config")
				.long("config")
				.value_name("PATH")
				.help("JSON5 configuration file"),
		)
		.arg(
			Arg::new("workspace")
				.long("workspace")
				.value_name("NAME")
				.help("Workspace name"),
		)
		.arg(Arg::new("path").long("path").value_name("DIR").help("Workspace directory"))
		.arg(
			Arg::new("secret")
				.long("secret")
				.value_name("UTF8")
				.help("Shared AES key for the auth handshake"),
		)
		.arg(
			Arg::new("ssl-cert")
				.long("ssl-cert")
				.value_name("PATH")
				.help("TLS certificate (PEM)"),
		)
		.arg(
			Arg::new("ssl-key")
				.long("ssl-key")
				.value_name("PATH")
				.help("TLS private key (PEM, server only)"),
		)
		.arg(
			Arg::new("dangling")
				.long("dangling")
				.value_name("POLICY")
				.value_parser(["remove", "keep", "panic"])
				.help("Policy for remote-only entries"),
		)
		.arg(
			Arg::new("generate-ssl-keys")
				.long("generate-ssl-keys")
				.action(ArgAction::SetTrue)
				.help("Generate a self-signed certificate pair and exit"),
		)
		.arg(Arg::new("usage").long("usage").action(ArgAction::Help).hide(true))
}

fn cli_options(matches: &clap::ArgMatches) -> Result<CliOptions, JanusError> {
	let mode = if matches.get_flag("server") {
		Some(Role::Server)
	} else if matches.get_flag("client") {
		Some(Role::Client)
	} else {
		None
	};

	let port = match matches.get_one::<String>("port") {
		Some(raw) => Some(raw.parse::<u16>().map_err(|_| JanusError::Config {
			message: format!("Invalid port '{}'", raw),
		})?),
		None => None,
	};

	let dangling = matches.get_one::<String>("dangling").map(|raw| match raw.as_str() {
		"keep" => DanglingPolicy::Keep,
		"panic" => DanglingPolicy::Panic,
		_ => DanglingPolicy::Remove,
	});

	Ok(CliOptions {
		mode,
		host: matches.get_one::<String>("host").cloned(),
		port,
		workspace: matches.get_one::<String>("workspace").cloned(),
		path: matches.get_one::<String>("path").map(PathBuf::from),
		secret: matches.get_one::<String>("secret").cloned(),
		ssl_cert: matches.get_one::<String>("ssl-cert").map(PathBuf::from),
		ssl_key: matches.get_one::<String>("ssl-key").map(PathBuf::from),
		dangling,
	})
}

fn run() -> Result<(), JanusError> {
	let matches = build_cli().get_matches();

	if matches.get_flag("generate-ssl-keys") {
		let cert = matches.get_one::<String>("ssl-cert").map(PathBuf::from);
		let key = matches.get_one::<String>("ssl-key").map(PathBuf::from);
		return keygen::generate_to(cert.as_deref(), key.as_deref());
	}

	let cli = cli_options(&matches)?;
	let file = match matches.get_one::<String>("config") {
		Some(path) => Some(config::load_file(std::path::Path::new(path))?),
		None => None,
	};
	let resolved = Arc::new(config::resolve(file, cli)?);

	// I/O-heavy workload: size the pool generously
	let workers = std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4).max(4);
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.worker_threads(workers)
		.enable_all()
		.build()
		.map_err(JanusError::Io)?;

	match resolved.role {
		Role::Server => runtime.block_on(server::run_server(Arc::clone(&resolved))),
		Role::Client => runtime.block_on(async {
			for ws in &resolved.workspaces {
				if ws.role != Role::Client {
					continue;
				}
				client::run_client(ws).await?;
			}
			Ok(())
		}),
	}
}

fn main() {
	init_tracing();
	if let Err(e) = run() {
		error!("{}", e);
		std::process::exit(e.exit_code());
	}
}

// vim: ts=4
