#![forbid(unsafe_code)]

use parley_client_core::{ClientConfig, ParleyClient};
use parley_util::endpoint::DEFAULT_PORT;
use parley_util::env::var_nonempty;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

const TOKEN_ENV: &str = "PARLEY_TOKEN";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client [--connect quic://host:port] [--token TOKEN] <command> [args]\n\
\n\
Commands:\n\
\tsign-up LOGIN PASSWORD       Create an account; prints an identity token\n\
\tsign-in LOGIN PASSWORD       Prints an identity token\n\
\tcreate-chat NAME             Prints the new chat id (identity token)\n\
\tadd-user CHAT_ID USER_ID     Owner only (identity token)\n\
\tjoin-chat CHAT_ID            Prints a room-join token (identity token)\n\
\tchat                         stdin lines -> messages, messages -> stdout (room-join token)\n\
\tping                         Round-trip check\n\
\n\
Options:\n\
\t--connect   Server endpoint (default: quic://127.0.0.1:{DEFAULT_PORT})\n\
\t--token     Token for the command (default: ${TOKEN_ENV})\n\
\t--help      Show this help\n\
"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,parley_client_core=info".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

enum Command {
	SignUp { login: String, password: String },
	SignIn { login: String, password: String },
	CreateChat { name: String },
	AddUser { chat_id: i64, user_id: i64 },
	JoinChat { chat_id: i64 },
	Chat,
	Ping,
}

struct Args {
	endpoint: String,
	token: Option<String>,
	command: Command,
}

fn parse_id(v: Option<String>, what: &str) -> i64 {
	let v = v.unwrap_or_else(|| usage_and_exit());
	v.parse().unwrap_or_else(|_| {
		eprintln!("{what} must be an integer, got {v:?}");
		usage_and_exit()
	})
}

fn parse_args() -> Args {
	let mut endpoint = format!("quic://127.0.0.1:{DEFAULT_PORT}");
	let mut token = var_nonempty(TOKEN_ENV);
	let mut positional: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				endpoint = it.next().unwrap_or_else(|| usage_and_exit());
			}
			"--token" => {
				token = Some(it.next().unwrap_or_else(|| usage_and_exit()));
			}
			other if other.starts_with("--") => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			_ => positional.push(arg),
		}
	}

	let mut pos = positional.into_iter();
	let command = match pos.next().as_deref() {
		Some("sign-up") => Command::SignUp {
			login: pos.next().unwrap_or_else(|| usage_and_exit()),
			password: pos.next().unwrap_or_else(|| usage_and_exit()),
		},
		Some("sign-in") => Command::SignIn {
			login: pos.next().unwrap_or_else(|| usage_and_exit()),
			password: pos.next().unwrap_or_else(|| usage_and_exit()),
		},
		Some("create-chat") => Command::CreateChat {
			name: pos.next().unwrap_or_else(|| usage_and_exit()),
		},
		Some("add-user") => Command::AddUser {
			chat_id: parse_id(pos.next(), "CHAT_ID"),
			user_id: parse_id(pos.next(), "USER_ID"),
		},
		Some("join-chat") => Command::JoinChat {
			chat_id: parse_id(pos.next(), "CHAT_ID"),
		},
		Some("chat") => Command::Chat,
		Some("ping") => Command::Ping,
		_ => usage_and_exit(),
	};

	if let Some(extra) = pos.next() {
		eprintln!("Unexpected argument: {extra}");
		usage_and_exit();
	}

	Args {
		endpoint,
		token,
		command,
	}
}

fn require_token(token: Option<String>) -> String {
	token.unwrap_or_else(|| {
		eprintln!("this command needs --token or ${TOKEN_ENV}");
		usage_and_exit()
	})
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig::from_quic_endpoint(&args.endpoint)?;
	let client = ParleyClient::connect(cfg).await?;

	match args.command {
		Command::SignUp { login, password } => println!("{}", client.sign_up(&login, &password).await?),
		Command::SignIn { login, password } => println!("{}", client.sign_in(&login, &password).await?),
		Command::CreateChat { name } => {
			println!("{}", client.create_chat(&require_token(args.token), &name).await?);
		}
		Command::AddUser { chat_id, user_id } => {
			client.add_user_to_chat(&require_token(args.token), chat_id, user_id).await?;
		}
		Command::JoinChat { chat_id } => {
			println!("{}", client.join_chat(&require_token(args.token), chat_id).await?);
		}
		Command::Ping => {
			let pong = client.ping().await?;
			println!("rtt_ms={}", pong.server_time_unix_ms - pong.client_time_unix_ms);
		}
		Command::Chat => {
			let session = client.connect_to_chat(&require_token(args.token)).await?;
			info!(
				chat_id = session.connected().chat_id,
				connection_id = %session.connected().connection_id,
				"joined chat"
			);
			let (mut sender, mut receiver) = session.into_split();

			let printer = tokio::spawn(async move {
				loop {
					match receiver.next_message().await {
						Ok(Some(m)) => println!("[{}] {}: {}", m.chat_id, m.sender_login, m.message),
						Ok(None) => break,
						Err(e) => {
							warn!(error = %e, "chat stream ended");
							break;
						}
					}
				}
			});

			let mut lines = BufReader::new(tokio::io::stdin()).lines();
			while let Some(line) = lines.next_line().await? {
				sender.send(&line).await?;
			}
			sender.finish()?;
			let _ = printer.await;
		}
	}

	client.close(0, "bye");
	Ok(())
}
