//! Handler - 副作用そのものを実行するジョブハンドラ
//!
//! # HandlerRegistry
//! - 起動時に組み立て（mutable）、実行時は読み取り専用（immutable）
//! - 1 ジョブ種別につき 1 ハンドラ。二重登録はエラー

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{ClassifiedError, JobPayload, JobType, mask_email};
use crate::error::PipelineError;
use crate::ports::{EmailMessage, EmailSender, OrderRepository, PaymentGateway, with_repo_timeout};
use crate::store::ClaimedJob;

/// 成功した attempt の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// 副作用が実行された。`reference` はプロバイダ側の ID
    Effected { reference: Option<String> },
    /// 何もする必要がない（決済がキャプチャ済み、またはキャンセル済みなど）
    Skipped { reason: String },
}

/// 1 ジョブ種別のハンドラ
///
/// 副作用と ack の間でクラッシュすると attempt が繰り返されるため、
/// 同じジョブに対して複数回実行されても安全でなければならない
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, job: &ClaimedJob) -> Result<HandlerOutcome, ClassifiedError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<(), PipelineError> {
        let job_type = handler.job_type();
        if self.handlers.contains_key(&job_type) {
            return Err(PipelineError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    /// 登録済みジョブ種別（順序は安定）
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// プロバイダ呼び出しに上限時間を設ける。超過はリトライ可能な timeout になる
pub async fn with_service_timeout<T, F>(limit: Duration, call: F) -> Result<T, ClassifiedError>
where
    F: Future<Output = Result<T, ClassifiedError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ClassifiedError::timed_out(limit)),
    }
}

fn decode(job: &ClaimedJob) -> Result<JobPayload, ClassifiedError> {
    let payload: JobPayload = job
        .decode()
        .map_err(|e| ClassifiedError::invalid_input(format!("undecodable payload: {e}")))?;
    if payload.job_type() != job.job_type {
        return Err(ClassifiedError::invalid_input(format!(
            "payload of type {} on a {} job",
            payload.job_type(),
            job.job_type
        )));
    }
    Ok(payload)
}

/// 変更可能期間が過ぎたオーソリ済み決済をキャプチャする
pub struct CaptureHandler {
    payments: Arc<dyn PaymentGateway>,
    orders: Arc<dyn OrderRepository>,
    timeout: Duration,
}

impl CaptureHandler {
    pub fn new(
        payments: Arc<dyn PaymentGateway>,
        orders: Arc<dyn OrderRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            payments,
            orders,
            timeout,
        }
    }
}

#[async_trait]
impl JobHandler for CaptureHandler {
    fn job_type(&self) -> JobType {
        JobType::PaymentCapture
    }

    async fn handle(&self, job: &ClaimedJob) -> Result<HandlerOutcome, ClassifiedError> {
        let JobPayload::PaymentCapture(payload) = decode(job)? else {
            return Err(ClassifiedError::invalid_input("expected a payment capture payload"));
        };

        let intent = with_service_timeout(
            self.timeout,
            self.payments.retrieve(&payload.payment_intent_id),
        )
        .await?;
        if !intent.status.is_capturable() {
            info!(
                order_id = %payload.order_id,
                payment_intent_id = %intent.id,
                status = %intent.status,
                "payment not capturable, skipping"
            );
            return Ok(HandlerOutcome::Skipped {
                reason: format!("payment intent is {}", intent.status),
            });
        }

        let captured = with_service_timeout(
            self.timeout,
            self.payments.capture(&payload.payment_intent_id),
        )
        .await?;
        info!(
            order_id = %payload.order_id,
            payment_intent_id = %captured.id,
            source = payload.source.as_str(),
            attempt = job.attempt,
            "payment captured"
        );

        // 決済は確定済み。記帳の失敗で attempt を失敗にはしない
        let marked = with_repo_timeout(
            self.timeout,
            self.orders.mark_payment_captured(&payload.order_id),
        )
        .await;
        if let Err(e) = marked {
            warn!(order_id = %payload.order_id, error = %e, "failed to mark order as captured");
        }

        Ok(HandlerOutcome::Effected {
            reference: Some(captured.id),
        })
    }
}

/// トランザクションメールを 1 通送る
pub struct EmailHandler {
    sender: Arc<dyn EmailSender>,
    timeout: Duration,
}

impl EmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>, timeout: Duration) -> Self {
        Self { sender, timeout }
    }
}

#[async_trait]
impl JobHandler for EmailHandler {
    fn job_type(&self) -> JobType {
        JobType::EmailDelivery
    }

    async fn handle(&self, job: &ClaimedJob) -> Result<HandlerOutcome, ClassifiedError> {
        let JobPayload::EmailDelivery(payload) = decode(job)? else {
            return Err(ClassifiedError::invalid_input("expected an email payload"));
        };

        let message = EmailMessage {
            to: payload.recipient,
            template: payload.template,
            data: payload.data,
        };
        let sent = with_service_timeout(self.timeout, self.sender.send(&message)).await?;
        info!(
            entity_id = %payload.entity_id,
            template = %message.template,
            recipient = %mask_email(Some(&message.to)),
            message_id = %sent.id,
            attempt = job.attempt,
            "email sent"
        );

        Ok(HandlerOutcome::Effected {
            reference: Some(sent.id),
        })
    }
}
