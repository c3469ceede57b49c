use clap::Parser;
use rewind::{
    catalog::fetch_service_plan, util::HttpClient, Authenticator, Rewind, StaticToken,
};
use tokio_util::sync::CancellationToken;

mod args;

use args::RewindArgs;

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// First ctrl-c stops the run gracefully, the second one exits.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupted, stopping after in-flight requests. Press ctrl-c again to exit.");
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = RewindArgs::parse();
    init_tracing(args.verbose);

    let config = args.config()?;
    let request = args.request()?;
    tracing::info!("Rewinding channel {} over {}", request.channel_id, request.window);

    let client = HttpClient::from_config(&config.http)?;
    let catalog = fetch_service_plan(&client, &config.provider.service_plan_url).await?;
    let session = StaticToken::new(args.token.clone(), catalog)
        .authenticate(None)
        .await?;
    if session.access_token().is_none() {
        tracing::warn!("No access token given, the provider may reject the request.");
    }

    let rewind = Rewind::builder(config).client(client).build()?;
    let outcome = rewind.run(&session, &request, &cancel_on_ctrl_c()).await?;

    if let Some(manifest) = &outcome.manifest {
        tracing::info!("Manifest: {}", manifest.display());
    }
    match &outcome.output {
        Some(output) => tracing::info!("Output: {}", output.display()),
        None => {
            for track in &outcome.tracks {
                tracing::info!("{}: {}", track.rendition.id, track.path.display());
            }
        }
    }

    Ok(())
}
