use contact_form_backend::{
    mailer::Mailer,
    server::{router, ContactFormMessageHandler},
    settings::Settings,
    spam_log::SpamLog,
    token::TokenSecret,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .json()
        .init();

    let settings = Settings::from_env()?;
    let secret = TokenSecret::resolve(settings.token_secret.as_deref())?;
    if settings.token_secret.is_none() {
        info!("Generated ephemeral token secret for this process");
    }
    let handler = ContactFormMessageHandler::new(
        secret,
        settings.allowed_origins,
        Mailer::new(settings.mail),
        SpamLog::new(settings.spam_log),
    );

    let address = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(address).await?;
    info!(%address, "Starting contact form backend");
    axum::serve(
        listener,
        router(handler).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
