//! Operator chat: feedback on the latest recommendation, or a contextual answer.

use crate::client::{ChatLog, Feedback, Outbound, OutboundSink};
use crate::models::field::InvalidFieldIdError;
use crate::models::wire::Recommendation;
use crate::services::fanout::{Notification, Topic};
use crate::services::responder::ResponderStrategy;
use crate::services::router::EventRouter;
use crate::services::store::FieldStateStore;
use crate::services::subscription::Subscription;
use crate::utils;
use chrono::Utc;
use log::debug;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    /// The message was forwarded as feedback on this recommendation.
    FeedbackQueued { recommendation_id: String, text: String },
    Answer(String),
}

impl ChatReply {
    pub fn text(&self) -> &str {
        match self {
            ChatReply::FeedbackQueued { text, .. } => text,
            ChatReply::Answer(text) => text,
        }
    }
}

pub struct ChatDesk {
    store: FieldStateStore,
    responder: Box<dyn ResponderStrategy>,
    outbound: Arc<dyn OutboundSink>,
    latest: Arc<Mutex<Option<Arc<Recommendation>>>>,
    feed: Option<Subscription>,
}

impl ChatDesk {
    pub fn new(store: FieldStateStore, responder: Box<dyn ResponderStrategy>, outbound: Arc<dyn OutboundSink>) -> Self {
        ChatDesk {
            store,
            responder,
            outbound,
            latest: Arc::new(Mutex::new(None)),
            feed: None,
        }
    }

    /// Follows the router's recommendation feed so feedback always targets the newest one.
    pub fn attach(router: &EventRouter, responder: Box<dyn ResponderStrategy>, outbound: Arc<dyn OutboundSink>) -> Self {
        let mut desk = ChatDesk::new(router.store().clone(), responder, outbound);
        let latest = Arc::clone(&desk.latest);
        desk.feed = Some(router.subscribe(Topic::Recommendations, move |n| {
            if let Notification::Recommendation(rec) = n {
                debug!("Chat desk now tracking recommendation {}", rec.id);
                *utils::lock(&latest) = Some(Arc::clone(rec));
            }
        }));
        desk
    }

    pub fn record(&self, recommendation: Arc<Recommendation>) {
        *utils::lock(&self.latest) = Some(recommendation);
    }

    pub fn latest(&self) -> Option<Arc<Recommendation>> {
        utils::lock(&self.latest).clone()
    }

    pub fn ask(&self, field_id: &str, text: &str) -> Result<ChatReply, InvalidFieldIdError> {
        let state = self.store.get(field_id)?;

        if mentions_recommendation(text)
            && let Some(rec) = self.latest()
        {
            self.outbound.submit(Outbound::Feedback(Feedback {
                recommendation_id: rec.id.clone(),
                comment: text.to_string(),
            }));
            return Ok(ChatReply::FeedbackQueued {
                recommendation_id: rec.id.clone(),
                text: format!("Feedback recorded for recommendation: {}. Thank you!", rec.title),
            });
        }

        let answer = self.responder.respond(text, &state);
        self.outbound.submit(Outbound::ChatLog(ChatLog {
            question: text.to_string(),
            sensor_data: state,
            timestamp: Utc::now(),
        }));
        Ok(ChatReply::Answer(answer))
    }

    pub fn detach(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.unsubscribe();
        }
    }
}

impl Drop for ChatDesk {
    fn drop(&mut self) {
        self.detach();
    }
}

fn mentions_recommendation(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("recommendation") || lowered.contains("recommandation")
}
