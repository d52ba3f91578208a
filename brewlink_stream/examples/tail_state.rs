use std::path::PathBuf;

use brewlink_reqwest::{ApiConfig, ApplianceApi};
use brewlink_stream::{
    ConnectionState, ConnectionSupervisor, SerialNumber, SupervisorConfig, WebSocketConnector,
};
use brewlink_tokens::{
    backoff, jitter, sources::oauth2::Auth0TokenSource, stores::FileTokenStore, ClientId,
    TokenManager,
};
use clap::Parser;
use futures_util::StreamExt;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(long, env, default_value = brewlink_tokens::sources::oauth2::DEFAULT_TOKEN_URL)]
    token_url: reqwest::Url,

    /// The client ID of the mobile application
    #[arg(long, env, default_value = brewlink_tokens::sources::oauth2::DEFAULT_CLIENT_ID)]
    client_id: String,

    /// The local file holding the refresh token
    #[arg(short = 'f', long, env, default_value = ".brewlink.json")]
    credentials_file: PathBuf,

    /// Appliances to follow; all of the account's appliances when omitted
    #[arg(short, long = "serial")]
    serials: Vec<String>,

    /// The appliance proxy to connect to
    #[arg(long, env, default_value = brewlink_stream::DEFAULT_URL)]
    stream_url: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let source = Auth0TokenSource::new(client, opts.token_url, ClientId::new(opts.client_id));
    let tokens = TokenManager::new(source, FileTokenStore::new(&opts.credentials_file));

    let first = tokens.valid_token().await?;
    let _refresher = tokens.spawn_refresher(
        jitter::RandomEarlyJitter::new(brewlink_clock::DurationSecs(60)),
        backoff::ErrorBackoffConfig::default(),
    );

    let connector = WebSocketConnector::new().with_url(opts.stream_url);
    let (handle, mut reports) =
        ConnectionSupervisor::new(connector, tokens.clone(), SupervisorConfig::default()).spawn();

    if opts.serials.is_empty() {
        let Some(subject) = first.subject() else {
            color_eyre::eyre::bail!("the ID token names no user");
        };
        let api = ApplianceApi::new(tokens.clone(), ApiConfig::default())?;
        for appliance in api.list_appliances(subject).await? {
            tracing::info!(serial = %appliance.serial_number, model = %appliance.model, "following appliance");
            handle.subscribe_model(SerialNumber::new(appliance.serial_number), appliance.model);
        }
    } else {
        for serial in opts.serials {
            handle.subscribe(SerialNumber::new(serial));
        }
    }

    let mut state = handle.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current: ConnectionState = *state.borrow_and_update();
            tracing::info!(state = %current, "stream state");
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown().await;
                return Ok(());
            }
            report = reports.next() => match report {
                Some(Ok(report)) => println!(
                    "{} {} {}",
                    report.serial_number,
                    report.reported_state().unwrap_or("unknown"),
                    report.data,
                ),
                Some(Err(err)) if err.is_terminal() => return Err(err.into()),
                Some(Err(err)) => tracing::warn!(error = %err, "bad message from the backend"),
                None => return Ok(()),
            },
        }
    }
}
