//! Collaboration view model: who is here, what they did, what they said.
//!
//! ## Design
//! - [`CollabState`] folds [`WireMessage`]s into a roster and a capped
//!   activity log. It never touches the transport.
//! - [`CollaborationView`] holds a live state and a fixture state side by
//!   side; the simulation toggle only changes which one is read.
//! - Rendering produces plain lines; the binary decides on colors.
//!
//! ## Roster rules
//! `(none) --join--> active --leave--> inactive(lastSeen)`, re-join clears
//! `lastSeen`. A `roster` frame from the relay is authoritative: anyone
//! missing from it is marked inactive.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::protocol::{
    CollaborationEvent, Collaborator, EventBody, EventKind, Roster, UserRef, Welcome, WireMessage,
};

/// Activity log length kept by default.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Joined,
    Left,
}

/// Toast-style summary of a roster change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub user_name: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NoticeKind::Joined => write!(f, "{} joined the session", self.user_name),
            NoticeKind::Left => write!(f, "{} left the session", self.user_name),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CollabState {
    collaborators: Vec<Collaborator>,
    events: VecDeque<CollaborationEvent>,
    capacity: usize,
    me: Option<UserRef>,
}

impl Default for CollabState {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl CollabState {
    pub fn new(capacity: usize) -> Self {
        Self {
            collaborators: Vec::new(),
            events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_LOG_CAPACITY)),
            capacity,
            me: None,
        }
    }

    /// Fold one frame into the state. Returns a notice for joins and leaves
    /// of known users.
    pub fn apply(&mut self, msg: &WireMessage) -> Option<Notice> {
        match msg {
            WireMessage::Welcome(welcome) => {
                self.apply_welcome(welcome);
                None
            }
            WireMessage::Roster(roster) => {
                self.reconcile(roster);
                None
            }
            other => other
                .collaboration_event()
                .and_then(|event| self.apply_event(event)),
        }
    }

    /// Fold one collaboration event into the roster and the log.
    pub fn apply_event(&mut self, event: CollaborationEvent) -> Option<Notice> {
        let notice = match event.kind {
            EventKind::Join => Some(self.mark_joined(&event.body)),
            EventKind::Leave => self.mark_left(&event.body),
            EventKind::Presence => {
                self.mark_present(&event.body);
                None
            }
            EventKind::Action | EventKind::Message | EventKind::Activity => None,
        };
        self.push_event(event);
        notice
    }

    fn apply_welcome(&mut self, welcome: &Welcome) {
        debug!(
            collaborators = welcome.active_collaborators.len(),
            "roster replaced from welcome"
        );
        self.collaborators = welcome.active_collaborators.clone();
        if welcome.you.is_some() {
            self.me = welcome.you.clone();
        }
    }

    fn reconcile(&mut self, roster: &Roster) {
        let mut deactivated = 0usize;
        for existing in self.collaborators.iter_mut() {
            let listed = roster
                .collaborators
                .iter()
                .any(|c| c.user_id == existing.user_id);
            if !listed && existing.is_active {
                existing.is_active = false;
                existing.last_seen = Some(roster.timestamp);
                deactivated += 1;
            }
        }
        for incoming in &roster.collaborators {
            match self.find_mut(&incoming.user_id) {
                Some(existing) => {
                    existing.user_name = incoming.user_name.clone();
                    existing.avatar = incoming.avatar.clone();
                    existing.is_active = true;
                    existing.last_seen = None;
                }
                None => {
                    let mut fresh = incoming.clone();
                    fresh.is_active = true;
                    fresh.last_seen = None;
                    self.collaborators.push(fresh);
                }
            }
        }
        debug!(
            listed = roster.collaborators.len(),
            deactivated, "roster reconciled"
        );
    }

    fn mark_joined(&mut self, body: &EventBody) -> Notice {
        match self.find_mut(&body.user.id) {
            Some(c) => {
                c.user_name = body.user.name.clone();
                if body.user.avatar.is_some() {
                    c.avatar = body.user.avatar.clone();
                }
                c.is_active = true;
                c.last_seen = None;
            }
            None => self
                .collaborators
                .push(Collaborator::joined(&body.user, body.timestamp)),
        }
        Notice {
            kind: NoticeKind::Joined,
            user_name: body.user.name.clone(),
            at: body.timestamp,
        }
    }

    fn mark_left(&mut self, body: &EventBody) -> Option<Notice> {
        let Some(c) = self.find_mut(&body.user.id) else {
            trace!(user = %body.user.id, "leave for unknown user ignored");
            return None;
        };
        c.is_active = false;
        c.last_seen = Some(body.timestamp);
        Some(Notice {
            kind: NoticeKind::Left,
            user_name: c.user_name.clone(),
            at: body.timestamp,
        })
    }

    fn mark_present(&mut self, body: &EventBody) {
        match self.find_mut(&body.user.id) {
            Some(c) => {
                c.is_active = true;
                c.last_seen = None;
            }
            None => self
                .collaborators
                .push(Collaborator::joined(&body.user, body.timestamp)),
        }
    }

    fn push_event(&mut self, event: CollaborationEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn find_mut(&mut self, user_id: &str) -> Option<&mut Collaborator> {
        self.collaborators.iter_mut().find(|c| c.user_id == user_id)
    }

    // -- projections ---------------------------------------------------------

    /// Every known collaborator, in order of first arrival.
    pub fn collaborators(&self) -> &[Collaborator] {
        &self.collaborators
    }

    pub fn collaborator(&self, user_id: &str) -> Option<&Collaborator> {
        self.collaborators.iter().find(|c| c.user_id == user_id)
    }

    pub fn active_count(&self) -> usize {
        self.collaborators.iter().filter(|c| c.is_active).count()
    }

    /// The activity log, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &CollaborationEvent> {
        self.events.iter()
    }

    /// The activity log, newest first.
    pub fn recent(&self) -> impl Iterator<Item = &CollaborationEvent> {
        self.events.iter().rev()
    }

    /// Chat messages, oldest first.
    pub fn chat(&self) -> impl Iterator<Item = &CollaborationEvent> {
        self.events.iter().filter(|e| e.kind == EventKind::Message)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Identity the relay assigned to this client, once welcomed.
    pub fn me(&self) -> Option<&UserRef> {
        self.me.as_ref()
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Tab {
    #[default]
    Activity,
    Users,
    Chat,
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tab::Activity => write!(f, "activity"),
            Tab::Users => write!(f, "users"),
            Tab::Chat => write!(f, "chat"),
        }
    }
}

/// Live and simulated collaboration state behind one toggle.
#[derive(Debug)]
pub struct CollaborationView {
    live: CollabState,
    simulated: CollabState,
    simulation: bool,
    simulator: Simulator,
}

impl CollaborationView {
    pub fn new(capacity: usize) -> Self {
        Self::with_simulator(capacity, Simulator::new())
    }

    pub fn with_simulator(capacity: usize, simulator: Simulator) -> Self {
        Self {
            live: CollabState::new(capacity),
            simulated: fixtures::sample_state(Utc::now(), capacity),
            simulation: false,
            simulator,
        }
    }

    /// Feed a frame from the socket. Live state keeps updating while the
    /// simulation is shown.
    pub fn apply(&mut self, msg: &WireMessage) -> Option<Notice> {
        self.live.apply(msg)
    }

    pub fn set_simulation(&mut self, on: bool) {
        self.simulation = on;
    }

    pub fn toggle_simulation(&mut self) -> bool {
        self.simulation = !self.simulation;
        self.simulation
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    /// Advance the fixture state by one canned event.
    pub fn tick_simulation(&mut self, now: DateTime<Utc>) -> Option<Notice> {
        let event = self.simulator.next_event(now);
        self.simulated.apply_event(event)
    }

    /// The state currently shown.
    pub fn current(&self) -> &CollabState {
        if self.simulation {
            &self.simulated
        } else {
            &self.live
        }
    }

    pub fn live(&self) -> &CollabState {
        &self.live
    }

    /// Display lines for one tab.
    pub fn render(&self, tab: Tab) -> Vec<String> {
        let state = self.current();
        match tab {
            Tab::Activity => {
                let lines: Vec<String> = state.recent().map(describe_event).collect();
                if lines.is_empty() {
                    vec!["No activity yet".to_string()]
                } else {
                    lines
                }
            }
            Tab::Users => {
                if state.collaborators().is_empty() {
                    return vec!["No collaborators".to_string()];
                }
                state.collaborators().iter().map(describe_collaborator).collect()
            }
            Tab::Chat => {
                let lines: Vec<String> = state
                    .chat()
                    .map(|e| {
                        format!(
                            "[{}] {}: {}",
                            clock(e.body.timestamp),
                            e.body.user.name,
                            e.body.details.as_deref().unwrap_or("")
                        )
                    })
                    .collect();
                if lines.is_empty() {
                    vec!["No messages yet".to_string()]
                } else {
                    lines
                }
            }
        }
    }
}

fn clock(ts: DateTime<Utc>) -> String {
    ts.format("%H:%M:%S").to_string()
}

/// One activity-log line.
pub fn describe_event(event: &CollaborationEvent) -> String {
    let b = &event.body;
    let who = &b.user.name;
    let what = match event.kind {
        EventKind::Join => format!("{who} joined"),
        EventKind::Leave => format!("{who} left"),
        EventKind::Message => format!("{who}: {}", b.details.as_deref().unwrap_or("")),
        EventKind::Presence => format!("{who} is {}", b.details.as_deref().unwrap_or("online")),
        EventKind::Action | EventKind::Activity => {
            let mut s = format!("{who} {}", b.action.as_deref().unwrap_or("did something"));
            if let Some(target) = &b.target {
                s.push(' ');
                s.push_str(target);
            }
            if let Some(details) = &b.details {
                s.push_str(" (");
                s.push_str(details);
                s.push(')');
            }
            s
        }
    };
    format!("[{}] {what}", clock(b.timestamp))
}

fn describe_collaborator(c: &Collaborator) -> String {
    if c.is_active {
        format!("● {} (active)", c.user_name)
    } else {
        match c.last_seen {
            Some(ts) => format!("○ {} (last seen {})", c.user_name, clock(ts)),
            None => format!("○ {} (away)", c.user_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Generates plausible activity from the fixture users.
#[derive(Debug)]
pub struct Simulator {
    rng: StdRng,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence, for tests and demos.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_event(&mut self, now: DateTime<Utc>) -> CollaborationEvent {
        let users = fixtures::users();
        let user = users
            .choose(&mut self.rng)
            .cloned()
            .unwrap_or_else(|| UserRef::new("sim", "Simulated"));
        let body = EventBody::new(user, now);

        match self.rng.gen_range(0..10u8) {
            0..=5 => {
                let (action, target) = fixtures::ACTIONS
                    .choose(&mut self.rng)
                    .copied()
                    .unwrap_or(("viewed", "dashboard"));
                CollaborationEvent::new(
                    EventKind::Action,
                    body.with_action(action).with_target(target),
                )
            }
            6..=8 => {
                let line = fixtures::CHAT_LINES
                    .choose(&mut self.rng)
                    .copied()
                    .unwrap_or("hi");
                CollaborationEvent::new(EventKind::Message, body.with_details(line))
            }
            _ => CollaborationEvent::new(EventKind::Presence, body.with_details("online")),
        }
    }
}

/// Canned data shown in simulation mode.
pub mod fixtures {
    use super::*;

    pub const ACTIONS: &[(&str, &str)] = &[
        ("edited", "workflow \"Etsy price sync\""),
        ("connected", "platform Fiverr"),
        ("viewed", "earnings report"),
        ("paused", "workflow \"Upwork bids\""),
        ("exported", "analytics CSV"),
    ];

    pub const CHAT_LINES: &[&str] = &[
        "Can someone check the Clickbank numbers?",
        "Pushed the new filter, looks good here",
        "I'll take the Amazon listings",
        "Heading out, back in 20",
    ];

    pub fn users() -> Vec<UserRef> {
        vec![
            UserRef::new("sim-alex", "Alex Morgan").with_avatar("/avatars/alex.png"),
            UserRef::new("sim-sam", "Sam Rivera"),
            UserRef::new("sim-jo", "Jo Chen"),
        ]
    }

    /// A populated state: three users, one of them away, and a short history.
    pub fn sample_state(now: DateTime<Utc>, capacity: usize) -> CollabState {
        let users = users();
        let mut state = CollabState::new(capacity);
        let at = |mins: i64| now - Duration::minutes(mins);

        for (i, user) in users.iter().enumerate() {
            state.apply_event(CollaborationEvent::new(
                EventKind::Join,
                EventBody::new(user.clone(), at(30 - i as i64)),
            ));
        }
        state.apply_event(CollaborationEvent::new(
            EventKind::Action,
            EventBody::new(users[0].clone(), at(20))
                .with_action("edited")
                .with_target("workflow \"Etsy price sync\""),
        ));
        state.apply_event(CollaborationEvent::new(
            EventKind::Message,
            EventBody::new(users[1].clone(), at(15)).with_details("Morning all"),
        ));
        state.apply_event(CollaborationEvent::new(
            EventKind::Leave,
            EventBody::new(users[2].clone(), at(5)),
        ));
        state
    }
}
