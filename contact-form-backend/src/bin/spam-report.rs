use contact_form_backend::{
    mailer::Mailer,
    report::{ReportOutcome, SpamReporter},
    settings::Settings,
    spam_log::SpamLog,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .json()
        .init();

    let settings = Settings::from_env()?;
    if !settings.report.enabled {
        info!("Spam reporting is disabled (SPAM_REPORT_ENABLED is not true)");
        return Ok(());
    }

    let reporter = SpamReporter::new(SpamLog::new(settings.spam_log), Mailer::new(settings.mail));
    match reporter.run().await? {
        ReportOutcome::NothingToReport => {}
        ReportOutcome::Sent(entries) => info!(entries, "Spam report sent"),
    }
    Ok(())
}
