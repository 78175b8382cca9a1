//! Turn-by-turn endpoint for the provider's voice assistant.
//!
//! The voice agent posts each caller utterance and speaks whatever
//! `response` comes back, so every failure still answers 200 with a spoken
//! fallback. Only an unreadable body is rejected.

use std::collections::BTreeMap;

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ringback_agent::{ReplyDecision, ReplyGuard};
use ringback_core::compliance::redact_pan;
use ringback_core::domain::conversation::{voice_conversation_id, Channel, MessageRequest};
use ringback_core::domain::lead::SOURCE_VOICE;
use ringback_core::domain::OrgId;
use ringback_core::envelope::EnvelopeError;
use ringback_core::errors::DomainError;
use ringback_core::phone::{normalize_e164, normalize_e164_digits};

use super::{reject, WebhookError, WebhookState};
use crate::publisher::EnqueueOptions;
use crate::voice_session::VoiceSessionCache;

pub(super) const REPLY_REPEAT: &str = "Could you say that again?";
pub(super) const REPLY_NO_TENANT: &str =
    "I'm sorry, I'm having technical difficulties. Can I help you via text instead?";
pub(super) const REPLY_PROCESSOR_FAILED: &str =
    "I'm sorry, I'm having a bit of trouble. Could you say that again?";
pub(super) const REPLY_EMPTY: &str = "I'm sorry, could you repeat that?";
pub(super) const REPLY_QUEUED: &str = "Let me look into that for you, one moment please.";
pub(super) const REPLY_QUEUE_FAILED: &str = "I'm sorry, I'm having technical difficulties.";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct VoiceTurn {
    pub org_id: Option<String>,
    pub transcript: String,
    pub summary: Option<String>,
    pub caller_number: Option<String>,
    pub called_number: Option<String>,
    pub call_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VoiceReply {
    pub response: String,
}

type VoiceResult = Result<(StatusCode, Json<VoiceReply>), (StatusCode, Json<WebhookError>)>;

fn spoken(text: &str) -> VoiceResult {
    Ok((StatusCode::OK, Json(VoiceReply { response: text.to_string() })))
}

pub(super) async fn voice_ai(State(state): State<WebhookState>, body: Bytes) -> VoiceResult {
    let turn: VoiceTurn = serde_json::from_slice(&body).map_err(|parse_error| {
        let invalid = DomainError::from(EnvelopeError::InvalidJson(parse_error.to_string()));
        reject(invalid.into(), "voice-ai")
    })?;

    let transcript = turn.transcript.trim();
    if transcript.is_empty() {
        return spoken(REPLY_REPEAT);
    }

    let Some(org_id) = resolve_voice_org(&state, &turn).await else {
        warn!(
            event_name = "voice.ai.no_tenant",
            called_number = turn.called_number.as_deref().unwrap_or(""),
            "voice turn could not be tied to a tenant"
        );
        return spoken(REPLY_NO_TENANT);
    };

    let caller_digits = turn.caller_number.as_deref().map(normalize_e164_digits).unwrap_or_default();
    let mut lead_id = String::new();
    let call_id = turn.call_id.as_deref().map(str::trim).filter(|call_id| !call_id.is_empty());
    let conversation_id = if caller_digits.is_empty() {
        match call_id {
            Some(call_id) => state.voice_sessions.get_or_create(org_id.as_str(), call_id).await,
            // Anonymous callers without a call id share nothing with each other.
            None => VoiceSessionCache::mint(org_id.as_str()),
        }
    } else {
        match state.leads.get_or_create_by_phone(&org_id, &caller_digits, SOURCE_VOICE, "").await {
            Ok(lead) => lead_id = lead.id.0,
            Err(lead_error) => warn!(
                event_name = "voice.ai.lead_failed",
                org_id = %org_id,
                error = %lead_error,
                "could not record caller as a lead"
            ),
        }
        voice_conversation_id(org_id.as_str(), &caller_digits)
    };

    // Callers read card numbers aloud; only the redacted text goes further.
    let spoken_text = redact_pan(transcript);
    let summary = turn
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|summary| !summary.is_empty())
        .map(redact_pan);
    if spoken_text.card_detected || summary.as_ref().is_some_and(|summary| summary.card_detected) {
        info!(
            event_name = "voice.ai.card_redacted",
            org_id = %org_id,
            conversation_id = %conversation_id,
            "card number redacted from voice turn"
        );
    }

    let mut metadata = BTreeMap::new();
    let message = match summary {
        Some(summary) => {
            let summary = summary.text;
            let said = &spoken_text.text;
            let message = format!("[Conversation so far: {summary}]\n\nPatient just said: {said}");
            metadata.insert("voice_prompt_addition".to_string(), summary);
            message
        }
        None => spoken_text.text,
    };
    if let Some(call_id) = &turn.call_id {
        metadata.insert("call_id".to_string(), call_id.clone());
    }

    let request = MessageRequest {
        org_id: org_id.to_string(),
        lead_id,
        conversation_id: conversation_id.clone(),
        channel: Channel::Voice,
        from: turn.caller_number.as_deref().map(normalize_e164).unwrap_or_default(),
        to: turn.called_number.as_deref().map(normalize_e164).unwrap_or_default(),
        message,
        metadata,
    };

    match &state.voice_processor {
        Some(processor) => {
            let answered =
                tokio::time::timeout(state.processor_timeout, processor.process_message(request)).await;
            let response = match answered {
                Ok(Ok(response)) => response,
                Ok(Err(processor_error)) => {
                    warn!(
                        event_name = "voice.ai.processor_failed",
                        org_id = %org_id,
                        conversation_id = %conversation_id,
                        error = %processor_error,
                        "conversation engine failed on voice turn"
                    );
                    return spoken(REPLY_PROCESSOR_FAILED);
                }
                Err(_) => {
                    warn!(
                        event_name = "voice.ai.processor_timeout",
                        org_id = %org_id,
                        conversation_id = %conversation_id,
                        timeout_secs = state.processor_timeout.as_secs(),
                        "conversation engine timed out on voice turn"
                    );
                    return spoken(REPLY_PROCESSOR_FAILED);
                }
            };
            match ReplyGuard::default().evaluate(&response.message) {
                ReplyDecision::Send { text, .. } => {
                    info!(
                        event_name = "voice.ai.answered",
                        org_id = %org_id,
                        conversation_id = %conversation_id,
                        "voice turn answered"
                    );
                    spoken(&text)
                }
                ReplyDecision::Suppress { reason_code } => {
                    info!(
                        event_name = "voice.ai.reply_withheld",
                        org_id = %org_id,
                        conversation_id = %conversation_id,
                        reason_code,
                        "voice reply withheld"
                    );
                    spoken(REPLY_EMPTY)
                }
            }
        }
        None => {
            let job_id =
                format!("voice:{org_id}:{conversation_id}:{}", Utc::now().timestamp_millis());
            match state
                .publisher
                .enqueue_message(&job_id, request, EnqueueOptions::without_job_tracking())
                .await
            {
                Ok(_) => spoken(REPLY_QUEUED),
                Err(publish_error) => {
                    warn!(
                        event_name = "voice.ai.enqueue_failed",
                        org_id = %org_id,
                        job_id = %job_id,
                        error = %publish_error,
                        "voice turn could not be queued"
                    );
                    spoken(REPLY_QUEUE_FAILED)
                }
            }
        }
    }
}

/// Called number first, then the explicit org id, then the demo tenant.
async fn resolve_voice_org(state: &WebhookState, turn: &VoiceTurn) -> Option<OrgId> {
    if let Some(called) = turn.called_number.as_deref().filter(|number| !number.trim().is_empty()) {
        match state.store.lookup_clinic_by_number(called).await {
            Ok(Some(route)) => return Some(route.org_id),
            Ok(None) => {}
            Err(lookup_error) => warn!(
                event_name = "voice.ai.lookup_failed",
                error = %lookup_error,
                "tenant lookup failed for voice turn"
            ),
        }
    }
    turn.org_id
        .as_deref()
        .map(str::trim)
        .filter(|org_id| !org_id.is_empty())
        .map(OrgId::from)
        .or_else(|| state.demo_org_id.clone())
}
