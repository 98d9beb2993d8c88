//! Scriptable payment and email providers.
//!
//! Both keep call counts and let a caller queue up failures per intent or
//! recipient. Used by the integration tests and `deferq simulate`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::{ClassifiedError, INVALID_EMAIL, mask_email};
use crate::ports::{
    EmailMessage, EmailSender, PaymentGateway, PaymentIntent, PaymentIntentStatus, SentEmail,
};

#[derive(Default)]
struct GatewayState {
    intents: HashMap<String, PaymentIntentStatus>,
    capture_failures: HashMap<String, VecDeque<ClassifiedError>>,
    retrieve_calls: HashMap<String, u32>,
    capture_calls: HashMap<String, u32>,
}

#[derive(Default)]
pub struct SimulatedPaymentGateway {
    state: Mutex<GatewayState>,
}

impl SimulatedPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_intent(&self, intent_id: &str, status: PaymentIntentStatus) {
        self.state
            .lock()
            .await
            .intents
            .insert(intent_id.to_string(), status);
    }

    /// The next captures of `intent_id` fail with `errors`, in order.
    pub async fn fail_captures(
        &self,
        intent_id: &str,
        errors: impl IntoIterator<Item = ClassifiedError>,
    ) {
        self.state
            .lock()
            .await
            .capture_failures
            .entry(intent_id.to_string())
            .or_default()
            .extend(errors);
    }

    pub async fn status_of(&self, intent_id: &str) -> Option<PaymentIntentStatus> {
        self.state.lock().await.intents.get(intent_id).copied()
    }

    pub async fn capture_calls(&self, intent_id: &str) -> u32 {
        let state = self.state.lock().await;
        state.capture_calls.get(intent_id).copied().unwrap_or(0)
    }

    pub async fn retrieve_calls(&self, intent_id: &str) -> u32 {
        let state = self.state.lock().await;
        state.retrieve_calls.get(intent_id).copied().unwrap_or(0)
    }
}

fn no_such_intent(intent_id: &str) -> ClassifiedError {
    ClassifiedError::from_provider(Some(404), format!("No such payment_intent: '{intent_id}'"))
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn retrieve(&self, intent_id: &str) -> Result<PaymentIntent, ClassifiedError> {
        let mut state = self.state.lock().await;
        *state.retrieve_calls.entry(intent_id.to_string()).or_default() += 1;
        let status = state
            .intents
            .get(intent_id)
            .copied()
            .ok_or_else(|| no_such_intent(intent_id))?;
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status,
        })
    }

    async fn capture(&self, intent_id: &str) -> Result<PaymentIntent, ClassifiedError> {
        let mut state = self.state.lock().await;
        *state.capture_calls.entry(intent_id.to_string()).or_default() += 1;

        if let Some(err) = state
            .capture_failures
            .get_mut(intent_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let status = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| no_such_intent(intent_id))?;
        if !status.is_capturable() {
            return Err(ClassifiedError::from_provider(
                Some(400),
                format!("This PaymentIntent could not be captured because it has a status of {status}."),
            ));
        }
        *status = PaymentIntentStatus::Succeeded;
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status: *status,
        })
    }
}

#[derive(Default)]
struct SenderState {
    failures: HashMap<String, VecDeque<ClassifiedError>>,
    attempts: HashMap<String, u32>,
    sent: Vec<EmailMessage>,
}

/// Rejects malformed recipients the way a real provider does, with a
/// permanent "invalid recipient" error.
#[derive(Default)]
pub struct SimulatedEmailSender {
    state: Mutex<SenderState>,
}

impl SimulatedEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next sends to `recipient` fail with `errors`, in order.
    pub async fn fail_sends(
        &self,
        recipient: &str,
        errors: impl IntoIterator<Item = ClassifiedError>,
    ) {
        self.state
            .lock()
            .await
            .failures
            .entry(recipient.to_string())
            .or_default()
            .extend(errors);
    }

    pub async fn attempts_to(&self, recipient: &str) -> u32 {
        let state = self.state.lock().await;
        state.attempts.get(recipient).copied().unwrap_or(0)
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl EmailSender for SimulatedEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<SentEmail, ClassifiedError> {
        let mut state = self.state.lock().await;
        *state.attempts.entry(message.to.clone()).or_default() += 1;

        if let Some(err) = state
            .failures
            .get_mut(&message.to)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if mask_email(Some(&message.to)) == INVALID_EMAIL {
            return Err(ClassifiedError::from_provider(
                None,
                format!("Invalid `to` field: {}", message.to),
            ));
        }

        state.sent.push(message.clone());
        Ok(SentEmail {
            id: format!("em_{}", Ulid::new()),
        })
    }
}
