use log::debug;
use mailin_embedded::{Handler, Server, SslConfig};
use std::{
    net::IpAddr,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};
use tokio::{
    sync::watch::{self, error::RecvError, Receiver, Sender},
    time::timeout,
};

pub const SMTP_HOST: &str = "localhost";
pub const SMTP_PORT: u16 = 4567;
pub const POISONED_SMTP_PORT: u16 = 4568;

/// Identities which tests configure for mail sent through the fake servers.
pub const FAKE_SMTP_USERNAME: &str = "fake SMTP username";
pub const FAKE_SMTP_PASSWORD: &str = "fake SMTP password";
pub const FAKE_SENDER: &str = "Web contact form <noreply@contact-form.test>";
pub const FAKE_RECIPIENT: &str = "Site Owner <owner@contact-form.test>";

#[derive(Clone)]
struct SmtpHandler {
    buffer: Vec<u8>,
    sender: Arc<Sender<String>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl Handler for SmtpHandler {
    fn data(&mut self, buf: &[u8]) -> std::io::Result<()> {
        debug!("Got data:\n{}", String::from_utf8_lossy(buf));
        self.buffer.extend(buf);
        Ok(())
    }

    fn data_end(&mut self) -> mailin_embedded::Response {
        let content = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        if let Ok(mut received) = self.received.lock() {
            received.push(content.clone());
        }
        let _ = self.sender.send(content);
        mailin_embedded::response::OK
    }

    fn auth_plain(
        &mut self,
        authorization_id: &str,
        authentication_id: &str,
        password: &str,
    ) -> mailin_embedded::Response {
        debug!("Got authentication data {authorization_id}, {authentication_id}, {password}");
        mailin_embedded::response::AUTH_OK
    }
}

/// An SMTP server on [`SMTP_PORT`] which accepts every message and keeps a copy of it.
pub struct FakeSmtpServer {
    server: Mutex<Option<Server<SmtpHandler>>>,
    receiver: tokio::sync::Mutex<Receiver<String>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl FakeSmtpServer {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel("".into());
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = SmtpHandler {
            buffer: Vec::new(),
            sender: Arc::new(sender),
            received: received.clone(),
        };
        let mut server = Server::new(handler);
        server
            .with_name("contact-form.test")
            .with_ssl(SslConfig::None)
            .unwrap()
            .with_addr(format!("0.0.0.0:{SMTP_PORT}"))
            .unwrap();
        Self {
            server: Mutex::new(Some(server)),
            receiver: tokio::sync::Mutex::new(receiver),
            received,
        }
    }

    pub fn start(&self) {
        let mut guard = self.server.lock().unwrap();
        if let Some(server) = guard.take() {
            std::thread::spawn(move || {
                let _ = server.serve();
            });
        }
    }

    pub async fn last_mail_content(&self) -> Result<String, RecvError> {
        let mut receiver = self.receiver.lock().await;
        receiver.changed().await?;
        let content = receiver.borrow_and_update().clone();
        drop(receiver);
        Ok(content)
    }

    /// All messages received since the last call to [`FakeSmtpServer::flush`].
    pub fn received_mails(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub async fn flush(&self) {
        let mut receiver = self.receiver.lock().await;
        let _ = timeout(Duration::from_millis(100), receiver.changed()).await;
        receiver.borrow_and_update();
        self.received.lock().unwrap().clear();
    }
}

impl Default for FakeSmtpServer {
    fn default() -> Self {
        Self::new()
    }
}

/// The fake SMTP server shared by every test in this process, started on first use.
pub fn fake_smtp() -> &'static FakeSmtpServer {
    static FAKE_SMTP: OnceLock<FakeSmtpServer> = OnceLock::new();
    let server = FAKE_SMTP.get_or_init(FakeSmtpServer::new);
    server.start();
    server
}

#[derive(Clone)]
struct PoisonedSmtpHandler;

impl Handler for PoisonedSmtpHandler {
    fn helo(&mut self, _ip: IpAddr, _domain: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }

    fn mail(&mut self, _ip: IpAddr, _domain: &str, _from: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }
}

/// Starts an SMTP server on [`POISONED_SMTP_PORT`] which rejects every transaction.
pub fn start_poisoned_smtp_server() {
    let handler = PoisonedSmtpHandler;
    let mut server = Server::new(handler);
    server
        .with_name("contact-form.test")
        .with_ssl(SslConfig::None)
        .unwrap()
        .with_addr(format!("0.0.0.0:{POISONED_SMTP_PORT}"))
        .unwrap();
    std::thread::spawn(move || {
        let _ = server.serve();
    });
}
