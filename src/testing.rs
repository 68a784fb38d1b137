//! Scripted backend and in-memory host shared by unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{AnalysisBackend, ChatMessage};
use crate::error::BackendError;
use crate::host::{
    AuthorKind, CharacterProfile, InjectionPosition, InjectionRole, InjectionSink, ProfileSource,
    Turn, TurnSource,
};

type Responder = Box<dyn Fn(&[ChatMessage]) -> Result<String, BackendError> + Send + Sync>;

pub struct ScriptedBackend {
    responder: Responder,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(responder: impl Fn(&[ChatMessage]) -> Result<String, BackendError> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Replies served in order; errors once exhausted.
    pub fn replies(replies: Vec<Result<String, BackendError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::EmptyResponse("scripted".into())))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage], _max_tokens: u32) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(messages)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInjection {
    pub text: String,
    pub position: InjectionPosition,
    pub depth: usize,
    pub role: InjectionRole,
}

#[derive(Default)]
pub struct FakeHost {
    chat_id: Mutex<Option<String>>,
    turns: Mutex<Vec<Turn>>,
    profile: Mutex<Option<CharacterProfile>>,
    model: Mutex<Option<String>>,
    injections: Mutex<BTreeMap<String, RecordedInjection>>,
}

impl FakeHost {
    pub fn new(chat_id: &str, profile: CharacterProfile) -> Self {
        let host = Self::default();
        *host.chat_id.lock().unwrap() = Some(chat_id.to_string());
        *host.profile.lock().unwrap() = Some(profile);
        host
    }

    /// Append a turn, returning its index.
    pub fn push_turn(&self, author: AuthorKind, text: &str) -> usize {
        let mut turns = self.turns.lock().unwrap();
        let index = turns.len();
        turns.push(Turn::new(index, author, text));
        index
    }

    /// Append a user turn and an assistant reply, returning the reply's index.
    pub fn exchange(&self, user: &str, reply: &str) -> usize {
        self.push_turn(AuthorKind::User, user);
        self.push_turn(AuthorKind::Assistant, reply)
    }

    pub fn replace_turn(&self, index: usize, text: &str) {
        if let Some(turn) = self.turns.lock().unwrap().iter_mut().find(|t| t.index == index) {
            turn.text = text.to_string();
        }
    }

    pub fn set_chat(&self, chat_id: Option<&str>) {
        *self.chat_id.lock().unwrap() = chat_id.map(str::to_string);
    }

    pub fn set_model(&self, model: &str) {
        *self.model.lock().unwrap() = Some(model.to_string());
    }

    pub fn set_profile(&self, profile: CharacterProfile) {
        *self.profile.lock().unwrap() = Some(profile);
    }

    pub fn injection(&self, key: &str) -> Option<RecordedInjection> {
        self.injections.lock().unwrap().get(key).cloned()
    }
}

impl TurnSource for FakeHost {
    fn current_chat_id(&self) -> Option<String> {
        self.chat_id.lock().unwrap().clone()
    }

    fn turns(&self) -> Vec<Turn> {
        self.turns.lock().unwrap().clone()
    }
}

impl ProfileSource for FakeHost {
    fn profile(&self) -> Option<CharacterProfile> {
        self.profile.lock().unwrap().clone()
    }

    fn model_identity(&self) -> Option<String> {
        self.model.lock().unwrap().clone()
    }
}

impl InjectionSink for FakeHost {
    fn set_injection(&self, key: &str, text: &str, position: InjectionPosition, depth: usize, role: InjectionRole) {
        self.injections.lock().unwrap().insert(
            key.to_string(),
            RecordedInjection {
                text: text.to_string(),
                position,
                depth,
                role,
            },
        );
    }

    fn clear_injection(&self, key: &str) {
        self.injections.lock().unwrap().remove(key);
    }
}

pub fn mira() -> CharacterProfile {
    CharacterProfile {
        name: "Mira".into(),
        description: "A lighthouse keeper who looks after every sailor who washes ashore.".into(),
        personality: "Warm, patient, quietly funny.".into(),
        ..Default::default()
    }
}
