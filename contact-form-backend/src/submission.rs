use crate::token::TokenSecret;
use serde::Deserialize;

pub const HONEYPOT_REASON: &str = "honeypot triggered";

/// The form as posted by the browser. Every field is optional here; [`ContactFormMessage::validate`]
/// decides what is required.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct ContactFormMessage {
    pub name: Option<String>,
    pub email: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "_next")]
    pub next: Option<String>,
    #[serde(rename = "_gotcha")]
    pub gotcha: Option<String>,
    pub nickname: Option<String>,
    #[serde(rename = "_ts_token")]
    pub token: Option<String>,
}

/// Why a form did not make it to the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Missing, expired or forged freshness token.
    InvalidToken,
    /// A honeypot field was filled in. Looks like success to the caller but is logged as spam.
    Honeypot { field: &'static str },
    MissingFields,
}

impl ContactFormMessage {
    pub fn validate<'a>(
        &'a self,
        secret: &TokenSecret,
        now: i64,
        client_ip: &'a str,
    ) -> Result<ValidatedContactFormMessage<'a>, Classification> {
        let token = self.token.as_deref().unwrap_or_default();
        if !secret.validate(token, now) {
            return Err(Classification::InvalidToken);
        }

        if let Some(field) = self.triggered_honeypot() {
            return Err(Classification::Honeypot { field });
        }

        let (Some(name), Some(email), Some(message)) = (
            non_blank(&self.name),
            non_blank(&self.email),
            non_blank(&self.message),
        ) else {
            return Err(Classification::MissingFields);
        };

        Ok(ValidatedContactFormMessage {
            name,
            email,
            subject: non_blank(&self.subject),
            message,
            next: non_blank(&self.next),
            client_ip,
        })
    }

    fn triggered_honeypot(&self) -> Option<&'static str> {
        [("_gotcha", &self.gotcha), ("nickname", &self.nickname)]
            .into_iter()
            .find(|(_, value)| value.as_deref().is_some_and(|value| !value.is_empty()))
            .map(|(field, _)| field)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ValidatedContactFormMessage<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub subject: Option<&'a str>,
    pub message: &'a str,
    pub next: Option<&'a str>,
    pub client_ip: &'a str,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
