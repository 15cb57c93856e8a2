use std::time::Duration;

use clap::Parser;
use resp_client::{Command, Config, Connection, Error, Event, Reply, Subscriber};
use tracing::{debug, info};

/// Sends one command to a RESP server and prints the reply, or listens on channels.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, env = "REDIS_PORT", default_value_t = 6379)]
    port: u16,

    #[arg(short = 'a', long, env = "REDIS_PASSWORD")]
    password: Option<String>,

    /// Wrap the connection in TLS (needs the `tls` feature)
    #[arg(long, env = "REDIS_TLS")]
    tls: bool,

    /// Bound on every reply read, in milliseconds
    #[arg(long, env = "REDIS_READ_TIMEOUT_MS")]
    read_timeout_ms: Option<u64>,

    /// Subscribe to these channels and print messages until interrupted
    #[arg(long, num_args = 1.., conflicts_with = "command")]
    subscribe: Vec<String>,

    /// Command name followed by its arguments, e.g. `SET key value`
    command: Vec<String>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::new(self.host.clone(), self.port).with_tls(self.tls);
        if let Some(ref password) = self.password {
            config = config.with_password(password.clone());
        }
        if let Some(ms) = self.read_timeout_ms {
            config = config.with_read_timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    if !args.subscribe.is_empty() {
        return listen(args.config(), &args.subscribe).await;
    }

    let Some((name, rest)) = args.command.split_first() else {
        return Err(Error::Usage("no command given".to_string()));
    };

    let command: Command = Command::new(name.as_str()).args(rest);
    let mut conn = Connection::connect(args.config()).await?;

    let reply: Reply = match conn.call(&command).await {
        Ok(reply) => reply,
        Err(Error::Server(msg)) => Reply::Error(msg),
        Err(err) => return Err(err),
    };
    println!("{}", reply);

    conn.close().await
}

async fn listen(config: Config, channels: &[String]) -> Result<(), Error> {
    let (subscriber, mut events) = Subscriber::connect(config).await?;
    subscriber.subscribe(channels).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, unsubscribing");
                break;
            }
            event = events.recv() => match event {
                Some(Event::MessageReceived(message)) => {
                    println!("{}: {}", message.channel, String::from_utf8_lossy(&message.payload));
                }
                Some(Event::SubscriptionChanged(change)) => {
                    info!(kind = %change.kind, count = change.count, "subscription changed");
                }
                Some(Event::TransactionQueued(_)) => {}
                None => break,
            },
        }
    }

    subscriber.shutdown().await
}
