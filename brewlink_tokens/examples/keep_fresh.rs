use std::{path::PathBuf, time::Duration};

use brewlink_clock::DurationSecs;
use brewlink_tokens::{
    backoff, jitter,
    sources::{oauth2::Auth0TokenSource, PasswordCredentials},
    stores::{FileTokenStore, TokenStore},
    ClientId, Password, TokenManager, TokenStatus, Username,
};
use clap::Parser;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(long, env, default_value = brewlink_tokens::sources::oauth2::DEFAULT_TOKEN_URL)]
    token_url: reqwest::Url,

    /// The client ID of the mobile application
    #[arg(long, env, default_value = brewlink_tokens::sources::oauth2::DEFAULT_CLIENT_ID)]
    client_id: String,

    /// The account's user name, used when no refresh token is stored
    #[arg(short, long, env = "BREVILLE_USERNAME")]
    username: Option<String>,

    /// The account's password
    #[arg(short, long, env = "BREVILLE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// The local file holding the refresh token
    #[arg(short = 'f', long, env, default_value = ".brewlink.json")]
    credentials_file: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let source = Auth0TokenSource::new(client, opts.token_url, ClientId::new(opts.client_id));
    let store = FileTokenStore::new(&opts.credentials_file);
    let has_stored_token = store
        .load()
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e))?
        .is_some();

    let manager = TokenManager::new(source, store);

    if !has_stored_token {
        let (Some(username), Some(password)) = (opts.username, opts.password) else {
            color_eyre::eyre::bail!("no stored refresh token; pass --username and --password");
        };
        let username = Username::new(username);
        let password = Password::new(password);
        manager
            .bootstrap(PasswordCredentials {
                username: &username,
                password: &password,
            })
            .await?;
    }

    let first = manager.valid_token().await?;
    tracing::info!(
        token = format_args!("{:#?}", first.id_token()),
        subject = first.subject(),
        "first ID token"
    );

    let _refresher = manager.spawn_refresher(
        jitter::RandomEarlyJitter::new(DurationSecs(60)),
        backoff::ErrorBackoffConfig::default(),
    );

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let Some(bundle) = manager.current() else {
            continue;
        };
        let status = bundle.status_with_clock(manager.clock(), manager.skew());
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(?status, expiry = bundle.expires_at().0, "pulled token")
            }
            TokenStatus::Stale => {
                tracing::warn!(?status, expiry = bundle.expires_at().0, "pulled token")
            }
            TokenStatus::Expired => {
                tracing::error!(?status, expiry = bundle.expires_at().0, "pulled token")
            }
        }

        if let Some(reason) = manager.revoked() {
            color_eyre::eyre::bail!("session ended: {reason}");
        }
    }
}
