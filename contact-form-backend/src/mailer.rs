use crate::{
    settings::{CompleteMailSettings, ConfigError, MailSettings, SmtpTls},
    submission::ValidatedContactFormMessage,
};
use async_once_cell::OnceCell;
use lettre::{
    address::AddressError,
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::{Credentials, Mechanism},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_SUBJECT: &str = "Contact Form Submission";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Mail is not configured: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Invalid address {address:?}: {source}")]
    Address {
        address: String,
        source: AddressError,
    },
    #[error("Error building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("Invalid SMTP endpoint: {0}")]
    Endpoint(lettre::transport::smtp::Error),
    #[error("Error sending message: {0}")]
    Transport(lettre::transport::smtp::Error),
}

/// Sends mail through the configured SMTP server. The transport is built on first use; if that
/// fails, the next message tries again.
pub struct Mailer {
    settings: MailSettings,
    transport: OnceCell<AsyncSmtpTransport<Tokio1Executor>>,
}

impl Mailer {
    pub fn new(settings: MailSettings) -> Self {
        Self {
            settings,
            transport: Default::default(),
        }
    }

    /// Forwards an accepted contact form message to the site owner. Exactly one delivery attempt
    /// is made.
    pub async fn send_submission(
        &self,
        message: &ValidatedContactFormMessage<'_>,
    ) -> Result<(), DispatchError> {
        let email = self.construct_submission_email(message)?;
        self.send(email).await
    }

    /// Sends an HTML report to the report recipient.
    pub async fn send_report(&self, subject: &str, html: String) -> Result<(), DispatchError> {
        let settings = self.settings.complete()?;
        let email = Message::builder()
            .from(parse_mailbox(settings.sender)?)
            .to(parse_mailbox(settings.report_recipient)?)
            .subject(subject)
            .date_now()
            .header(ContentType::TEXT_HTML)
            .body(html)?;
        self.send(email).await
    }

    fn construct_submission_email(
        &self,
        message: &ValidatedContactFormMessage,
    ) -> Result<Message, DispatchError> {
        let settings = self.settings.complete()?;
        let mut builder = Message::builder()
            .from(parse_mailbox(settings.sender)?)
            .to(parse_mailbox(settings.recipient)?)
            .subject(message.subject.unwrap_or(DEFAULT_SUBJECT))
            .date_now();
        match message.email.parse::<Address>() {
            Ok(address) => {
                builder = builder.reply_to(Mailbox::new(Some(message.name.into()), address));
            }
            Err(error) => debug!("Not setting Reply-To for {:?}: {error}", message.email),
        }
        Ok(builder.header(ContentType::TEXT_PLAIN).body(format!(
            "Name: {}\nEmail: {}\nMessage:\n{}",
            message.name, message.email, message.message
        ))?)
    }

    async fn send(&self, email: Message) -> Result<(), DispatchError> {
        let transport = self
            .transport
            .get_or_try_init(async { self.initialise_transport() })
            .await?;
        transport
            .send(email)
            .await
            .map_err(DispatchError::Transport)?;
        Ok(())
    }

    fn initialise_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, DispatchError> {
        let settings = self.settings.complete()?;
        let smtp_url = smtp_url(&settings);
        info!("initialise_transport: Connecting to {smtp_url}");
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::from_url(&smtp_url)
            .map_err(DispatchError::Endpoint)?
            .authentication(vec![Mechanism::Plain]);

        // Credentials only ever travel over TLS. A server which insists on authentication will
        // reject a misconfigured plaintext connection instead.
        if settings.tls != SmtpTls::None {
            builder = builder.credentials(Credentials::new(
                settings.username.into(),
                settings.password.into(),
            ));
        }

        Ok(builder.build())
    }
}

fn smtp_url(settings: &CompleteMailSettings) -> String {
    let CompleteMailSettings { host, port, .. } = settings;
    match settings.tls {
        SmtpTls::Implicit => format!("smtps://{host}:{port}"),
        SmtpTls::StartTls => format!("smtp://{host}:{port}?tls=required"),
        SmtpTls::None => format!("smtp://{host}:{port}"),
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DispatchError> {
    address.parse().map_err(|source| DispatchError::Address {
        address: address.into(),
        source,
    })
}
