//! # Streaming Builder
//!
//! Event-driven map construction: a paired start/end protocol over a
//! state stack, so deserializers can feed constructs without knowing
//! in advance whether an incoming topic already exists.
//!
//! Topics materialize eagerly on `start_topic`, because identity
//! resolution (and therefore merging) must happen the moment an identity
//! arrives. Everything else buffers in a pending frame and lands on its
//! `end_*` call, once type, scope, value and reifier are all known.
//!
//! A merge can fire in the middle of a stream and remove a topic the
//! stack still points at. After every merge-capable call the builder
//! drains the map's merge log and rewrites every stale handle in its
//! frames, so construction continues against the survivor.

use crate::graph::TopicMap;
use crate::merge::MergeEngine;
use crate::primitives::{PSI_INSTANCE, PSI_TOPIC_NAME, PSI_TYPE, PSI_TYPE_INSTANCE};
use crate::types::{ConstructId, ConstructKind, IdentityRef, Locator, ScopeId, TomaError};

// =============================================================================
// STATES AND FRAMES
// =============================================================================

/// Position in the start/end protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Map,
    Topic,
    Association,
    Role,
    Occurrence,
    Name,
    Variant,
    Scope,
    Isa,
    Theme { assigned: bool },
    Type { assigned: bool },
    Player { assigned: bool },
    Reifier { assigned: bool },
}

impl State {
    fn label(self) -> &'static str {
        match self {
            State::Map => "topic map",
            State::Topic => "topic",
            State::Association => "association",
            State::Role => "role",
            State::Occurrence => "occurrence",
            State::Name => "name",
            State::Variant => "variant",
            State::Scope => "scope",
            State::Isa => "isa",
            State::Theme { .. } => "theme",
            State::Type { .. } => "type",
            State::Player { .. } => "player",
            State::Reifier { .. } => "reifier",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PendingRole {
    typ: Option<ConstructId>,
    player: Option<ConstructId>,
    reifier: Option<ConstructId>,
    item_identifiers: Vec<Locator>,
}

#[derive(Debug, Clone, Default)]
struct PendingAssociation {
    typ: Option<ConstructId>,
    themes: Vec<ConstructId>,
    reifier: Option<ConstructId>,
    item_identifiers: Vec<Locator>,
    roles: Vec<PendingRole>,
}

#[derive(Debug, Clone)]
struct PendingOccurrence {
    parent: ConstructId,
    typ: Option<ConstructId>,
    value: Option<(String, Option<Locator>)>,
    themes: Vec<ConstructId>,
    reifier: Option<ConstructId>,
    item_identifiers: Vec<Locator>,
}

#[derive(Debug, Clone, Default)]
struct PendingVariant {
    value: Option<(String, Option<Locator>)>,
    themes: Vec<ConstructId>,
    reifier: Option<ConstructId>,
    item_identifiers: Vec<Locator>,
}

#[derive(Debug, Clone)]
struct PendingName {
    parent: ConstructId,
    typ: Option<ConstructId>,
    value: Option<String>,
    themes: Vec<ConstructId>,
    reifier: Option<ConstructId>,
    item_identifiers: Vec<Locator>,
    variants: Vec<PendingVariant>,
}

/// A construct under construction. Marker states (scope, theme, type,
/// player, reifier, isa) carry no frame; topic handles are live map
/// constructs, the rest buffer until their `end_*`.
#[derive(Debug, Clone)]
enum Frame {
    Map,
    Topic(ConstructId),
    Association(PendingAssociation),
    Role(PendingRole),
    Occurrence(PendingOccurrence),
    Name(PendingName),
    Variant(PendingVariant),
}

impl Frame {
    fn rewrite(&mut self, doomed: ConstructId, survivor: ConstructId) {
        let fix = |id: &mut ConstructId| {
            if *id == doomed {
                *id = survivor;
            }
        };
        let fix_opt = |id: &mut Option<ConstructId>| {
            if *id == Some(doomed) {
                *id = Some(survivor);
            }
        };
        let fix_role = |role: &mut PendingRole| {
            fix_opt(&mut role.typ);
            fix_opt(&mut role.player);
            fix_opt(&mut role.reifier);
        };
        match self {
            Frame::Map => {}
            Frame::Topic(id) => fix(id),
            Frame::Association(p) => {
                fix_opt(&mut p.typ);
                p.themes.iter_mut().for_each(fix);
                fix_opt(&mut p.reifier);
                p.roles.iter_mut().for_each(fix_role);
            }
            Frame::Role(p) => fix_role(p),
            Frame::Occurrence(p) => {
                fix(&mut p.parent);
                fix_opt(&mut p.typ);
                p.themes.iter_mut().for_each(fix);
                fix_opt(&mut p.reifier);
            }
            Frame::Name(p) => {
                fix(&mut p.parent);
                fix_opt(&mut p.typ);
                p.themes.iter_mut().for_each(fix);
                fix_opt(&mut p.reifier);
                for variant in &mut p.variants {
                    variant.themes.iter_mut().for_each(fix);
                    fix_opt(&mut variant.reifier);
                }
            }
            Frame::Variant(p) => {
                p.themes.iter_mut().for_each(fix);
                fix_opt(&mut p.reifier);
            }
        }
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Streaming topic map construction.
///
/// ```
/// use toma_core::{IdentityRef, MapBuilder};
///
/// let mut builder = MapBuilder::new();
/// builder.start_topic_map()?;
/// builder.start_topic(&IdentityRef::subject_identifier("http://example.org/puccini"))?;
/// builder.start_name()?;
/// builder.value("Giacomo Puccini", None)?;
/// builder.end_name()?;
/// builder.end_topic()?;
/// builder.end_topic_map()?;
/// let map = builder.finish()?;
/// // Puccini plus the default name-type topic.
/// assert_eq!(map.topic_count(), 2);
/// # Ok::<(), toma_core::TomaError>(())
/// ```
#[derive(Debug, Default)]
pub struct MapBuilder {
    map: TopicMap,
    states: Vec<State>,
    frames: Vec<Frame>,
}

impl MapBuilder {
    /// Build into a fresh map.
    #[must_use]
    pub fn new() -> Self {
        Self::with_map(TopicMap::new())
    }

    /// Build into an existing map; streamed constructs merge with what
    /// is already there.
    #[must_use]
    pub fn with_map(map: TopicMap) -> Self {
        Self {
            map,
            states: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// The map built so far.
    #[must_use]
    pub fn map(&self) -> &TopicMap {
        &self.map
    }

    /// Take the finished map. The stream must be fully closed.
    pub fn finish(self) -> Result<TopicMap, TomaError> {
        if !self.states.is_empty() {
            return Err(TomaError::Protocol(format!(
                "stream ended inside {}",
                self.state_label()
            )));
        }
        Ok(self.map)
    }

    fn state_label(&self) -> &'static str {
        self.states.last().map_or("nothing", |s| s.label())
    }

    fn state(&self) -> Result<State, TomaError> {
        self.states
            .last()
            .copied()
            .ok_or_else(|| TomaError::Protocol("no open topic map".to_string()))
    }

    fn misplaced(&self, op: &str) -> TomaError {
        TomaError::Protocol(format!("{op} not allowed inside {}", self.state_label()))
    }

    /// Rewrite every frame the latest merges invalidated.
    fn apply_merges(&mut self) {
        for (doomed, survivor) in self.map.drain_merges() {
            for frame in &mut self.frames {
                frame.rewrite(doomed, survivor);
            }
        }
    }

    fn current_topic(&self) -> Result<ConstructId, TomaError> {
        match self.frames.last() {
            Some(Frame::Topic(id)) => Ok(*id),
            _ => Err(TomaError::Protocol(
                "no topic under construction".to_string(),
            )),
        }
    }

    // =========================================================================
    // MAP level
    // =========================================================================

    /// Open the stream.
    pub fn start_topic_map(&mut self) -> Result<(), TomaError> {
        if !self.states.is_empty() {
            return Err(self.misplaced("start_topic_map"));
        }
        self.states.push(State::Map);
        self.frames.push(Frame::Map);
        Ok(())
    }

    /// Close the stream and run end-of-stream normalization.
    pub fn end_topic_map(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Map || self.states.len() != 1 {
            return Err(self.misplaced("end_topic_map"));
        }
        self.states.pop();
        self.frames.pop();
        self.normalize_type_instance()?;
        Ok(())
    }

    /// Rewrite unconstrained-scope type-instance associations into
    /// plain topic types, then drop them.
    fn normalize_type_instance(&mut self) -> Result<(), TomaError> {
        let Some(assoc_type) = self
            .map
            .topic_by_subject_identifier(&Locator::new(PSI_TYPE_INSTANCE))
        else {
            return Ok(());
        };
        let Some(type_role) = self.map.topic_by_subject_identifier(&Locator::new(PSI_TYPE))
        else {
            return Ok(());
        };
        let Some(instance_role) = self
            .map
            .topic_by_subject_identifier(&Locator::new(PSI_INSTANCE))
        else {
            return Ok(());
        };

        self.map.ensure_indexes_live();
        for candidate in self.map.instances_of(assoc_type) {
            if self.map.kind_of(candidate)? != ConstructKind::Association {
                continue;
            }
            let data = self.map.association(candidate)?;
            if data.scope != ScopeId::UNCONSTRAINED || data.roles.len() != 2 {
                continue;
            }
            let mut typ = None;
            let mut instance = None;
            for &role in &data.roles {
                let rd = self.map.role(role)?;
                if rd.typ == type_role {
                    typ = Some(rd.player);
                } else if rd.typ == instance_role {
                    instance = Some(rd.player);
                }
            }
            if let (Some(typ), Some(instance)) = (typ, instance) {
                self.map.remove_construct(candidate)?;
                self.map.add_topic_type(instance, typ)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // TOPICS
    // =========================================================================

    /// Open a topic, resolving the identity against the map. Inside a
    /// scope, type, player, isa or reifier context this names the topic
    /// filling that slot.
    pub fn start_topic(&mut self, identity: &IdentityRef) -> Result<(), TomaError> {
        match self.state()? {
            State::Map | State::Scope | State::Isa => {}
            State::Theme { assigned }
            | State::Type { assigned }
            | State::Player { assigned }
            | State::Reifier { assigned } => {
                if assigned {
                    return Err(TomaError::Protocol(format!(
                        "{} takes exactly one topic",
                        self.state_label()
                    )));
                }
            }
            _ => return Err(self.misplaced("start_topic")),
        }
        let topic = self.map.ensure_topic(identity)?;
        self.apply_merges();
        self.states.push(State::Topic);
        self.frames.push(Frame::Topic(topic));
        Ok(())
    }

    /// Name a topic by identity without opening it: the resolved topic
    /// fills the current scope, isa, theme, type, player or reifier
    /// slot directly.
    pub fn topic_ref(&mut self, identity: &IdentityRef) -> Result<(), TomaError> {
        let enclosing = self.state()?;
        match enclosing {
            State::Scope | State::Isa => {}
            State::Theme { assigned }
            | State::Type { assigned }
            | State::Player { assigned }
            | State::Reifier { assigned } => {
                if assigned {
                    return Err(TomaError::Protocol(format!(
                        "{} takes exactly one topic",
                        self.state_label()
                    )));
                }
            }
            _ => return Err(self.misplaced("topic_ref")),
        }
        let topic = self.map.ensure_topic(identity)?;
        self.apply_merges();
        self.deliver_topic(topic, enclosing)
    }

    /// Close the current topic, delivering it to the enclosing context.
    pub fn end_topic(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Topic {
            return Err(self.misplaced("end_topic"));
        }
        self.states.pop();
        let topic = match self.frames.pop() {
            Some(Frame::Topic(id)) => id,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "topic state without topic frame".to_string(),
                ));
            }
        };
        let Some(&enclosing) = self.states.last() else {
            return Err(TomaError::InternalInvariant(
                "topic closed with empty stack".to_string(),
            ));
        };
        match enclosing {
            State::Map => Ok(()),
            _ => self.deliver_topic(topic, enclosing),
        }
    }

    /// Hand a resolved topic to the slot context it was named in.
    fn deliver_topic(&mut self, topic: ConstructId, enclosing: State) -> Result<(), TomaError> {
        match enclosing {
            State::Scope => {
                self.deliver_theme(topic);
                Ok(())
            }
            State::Isa => {
                let current = self.current_topic()?;
                self.map.add_topic_type(current, topic)?;
                Ok(())
            }
            State::Theme { .. } => {
                self.set_marker_assigned();
                self.deliver_theme(topic);
                Ok(())
            }
            State::Type { .. } => {
                self.set_marker_assigned();
                self.deliver_type(topic)
            }
            State::Player { .. } => {
                self.set_marker_assigned();
                self.deliver_player(topic)
            }
            State::Reifier { .. } => {
                self.set_marker_assigned();
                self.deliver_reifier(topic)
            }
            _ => Err(TomaError::InternalInvariant(
                "topic nested in non-topic-bearing state".to_string(),
            )),
        }
    }

    fn set_marker_assigned(&mut self) {
        if let Some(state) = self.states.last_mut() {
            match state {
                State::Theme { assigned }
                | State::Type { assigned }
                | State::Player { assigned }
                | State::Reifier { assigned } => *assigned = true,
                _ => {}
            }
        }
    }

    fn deliver_theme(&mut self, theme: ConstructId) {
        match self.frames.last_mut() {
            Some(Frame::Association(p)) => p.themes.push(theme),
            Some(Frame::Occurrence(p)) => p.themes.push(theme),
            Some(Frame::Name(p)) => p.themes.push(theme),
            Some(Frame::Variant(p)) => p.themes.push(theme),
            _ => {}
        }
    }

    fn deliver_type(&mut self, typ: ConstructId) -> Result<(), TomaError> {
        match self.frames.last_mut() {
            Some(Frame::Association(p)) => p.typ = Some(typ),
            Some(Frame::Role(p)) => p.typ = Some(typ),
            Some(Frame::Occurrence(p)) => p.typ = Some(typ),
            Some(Frame::Name(p)) => p.typ = Some(typ),
            _ => {
                return Err(TomaError::InternalInvariant(
                    "type context without typed frame".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn deliver_player(&mut self, player: ConstructId) -> Result<(), TomaError> {
        match self.frames.last_mut() {
            Some(Frame::Role(p)) => {
                p.player = Some(player);
                Ok(())
            }
            _ => Err(TomaError::InternalInvariant(
                "player context without role frame".to_string(),
            )),
        }
    }

    fn deliver_reifier(&mut self, reifier: ConstructId) -> Result<(), TomaError> {
        enum Receiver {
            MapRoot,
            Topic(ConstructId),
            Pending,
        }
        let receiver = match self.frames.last() {
            Some(Frame::Map) => Receiver::MapRoot,
            Some(Frame::Topic(id)) => Receiver::Topic(*id),
            Some(_) => Receiver::Pending,
            None => {
                return Err(TomaError::InternalInvariant(
                    "reifier context without frame".to_string(),
                ));
            }
        };
        match receiver {
            Receiver::MapRoot => self.map.set_reifier(ConstructId::TOPIC_MAP, Some(reifier)),
            Receiver::Topic(current) => {
                // A reifier reference on a topic identifies the same
                // subject: the two topics merge.
                MergeEngine::merge_topics(&mut self.map, reifier, current)?;
                self.apply_merges();
                Ok(())
            }
            Receiver::Pending => {
                match self.frames.last_mut() {
                    Some(Frame::Association(p)) => p.reifier = Some(reifier),
                    Some(Frame::Role(p)) => p.reifier = Some(reifier),
                    Some(Frame::Occurrence(p)) => p.reifier = Some(reifier),
                    Some(Frame::Name(p)) => p.reifier = Some(reifier),
                    Some(Frame::Variant(p)) => p.reifier = Some(reifier),
                    _ => {
                        return Err(TomaError::InternalInvariant(
                            "reifier context without frame".to_string(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // IDENTITIES
    // =========================================================================

    /// Add a subject identifier to the current topic, merging on
    /// collision.
    pub fn subject_identifier(&mut self, locator: Locator) -> Result<(), TomaError> {
        if self.state()? != State::Topic {
            return Err(self.misplaced("subject_identifier"));
        }
        let topic = self.current_topic()?;
        self.map.add_subject_identifier(topic, locator)?;
        self.apply_merges();
        Ok(())
    }

    /// Add a subject locator to the current topic, merging on collision.
    pub fn subject_locator(&mut self, locator: Locator) -> Result<(), TomaError> {
        if self.state()? != State::Topic {
            return Err(self.misplaced("subject_locator"));
        }
        let topic = self.current_topic()?;
        self.map.add_subject_locator(topic, locator)?;
        self.apply_merges();
        Ok(())
    }

    /// Add an item identifier to the construct under construction.
    pub fn item_identifier(&mut self, locator: Locator) -> Result<(), TomaError> {
        match self.state()? {
            State::Map => {
                self.map
                    .add_item_identifier(ConstructId::TOPIC_MAP, locator)?;
                Ok(())
            }
            State::Topic => {
                let topic = self.current_topic()?;
                self.map.add_item_identifier(topic, locator)?;
                self.apply_merges();
                Ok(())
            }
            State::Association | State::Role | State::Occurrence | State::Name | State::Variant => {
                match self.frames.last_mut() {
                    Some(Frame::Association(p)) => p.item_identifiers.push(locator),
                    Some(Frame::Role(p)) => p.item_identifiers.push(locator),
                    Some(Frame::Occurrence(p)) => p.item_identifiers.push(locator),
                    Some(Frame::Name(p)) => p.item_identifiers.push(locator),
                    Some(Frame::Variant(p)) => p.item_identifiers.push(locator),
                    _ => {
                        return Err(TomaError::InternalInvariant(
                            "construct state without frame".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            _ => Err(self.misplaced("item_identifier")),
        }
    }

    // =========================================================================
    // MARKER CONTEXTS
    // =========================================================================

    /// Open the scope of the current association, occurrence, name or
    /// variant. Each topic closed inside becomes a theme.
    pub fn start_scope(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Association | State::Occurrence | State::Name | State::Variant => {
                self.states.push(State::Scope);
                Ok(())
            }
            _ => Err(self.misplaced("start_scope")),
        }
    }

    pub fn end_scope(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Scope {
            return Err(self.misplaced("end_scope"));
        }
        self.states.pop();
        Ok(())
    }

    /// Open a single theme slot inside the current scope. Exactly one
    /// topic must be named inside.
    pub fn start_theme(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Scope {
            return Err(self.misplaced("start_theme"));
        }
        self.states.push(State::Theme { assigned: false });
        Ok(())
    }

    pub fn end_theme(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Theme { assigned: true } => {
                self.states.pop();
                Ok(())
            }
            State::Theme { assigned: false } => {
                Err(TomaError::Protocol("theme requires a topic".to_string()))
            }
            _ => Err(self.misplaced("end_theme")),
        }
    }

    /// Open the type of the current typed construct. Exactly one topic
    /// must be closed inside. Variants are untyped.
    pub fn start_type(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Association | State::Role | State::Occurrence | State::Name => {
                self.states.push(State::Type { assigned: false });
                Ok(())
            }
            _ => Err(self.misplaced("start_type")),
        }
    }

    pub fn end_type(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Type { assigned: true } => {
                self.states.pop();
                Ok(())
            }
            State::Type { assigned: false } => {
                Err(TomaError::Protocol("type requires a topic".to_string()))
            }
            _ => Err(self.misplaced("end_type")),
        }
    }

    /// Open an isa context on the current topic. Every topic closed
    /// inside joins the current topic's type-set.
    pub fn start_isa(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Topic {
            return Err(self.misplaced("start_isa"));
        }
        self.states.push(State::Isa);
        Ok(())
    }

    pub fn end_isa(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Isa {
            return Err(self.misplaced("end_isa"));
        }
        self.states.pop();
        Ok(())
    }

    /// Open the player of the current role.
    pub fn start_player(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Role {
            return Err(self.misplaced("start_player"));
        }
        self.states.push(State::Player { assigned: false });
        Ok(())
    }

    pub fn end_player(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Player { assigned: true } => {
                self.states.pop();
                Ok(())
            }
            State::Player { assigned: false } => {
                Err(TomaError::Protocol("player requires a topic".to_string()))
            }
            _ => Err(self.misplaced("end_player")),
        }
    }

    /// Open the reifier of the construct under construction. On a topic,
    /// the named topic merges with it instead.
    pub fn start_reifier(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Map
            | State::Topic
            | State::Association
            | State::Role
            | State::Occurrence
            | State::Name
            | State::Variant => {
                self.states.push(State::Reifier { assigned: false });
                Ok(())
            }
            _ => Err(self.misplaced("start_reifier")),
        }
    }

    pub fn end_reifier(&mut self) -> Result<(), TomaError> {
        match self.state()? {
            State::Reifier { assigned: true } => {
                self.states.pop();
                Ok(())
            }
            State::Reifier { assigned: false } => {
                Err(TomaError::Protocol("reifier requires a topic".to_string()))
            }
            _ => Err(self.misplaced("end_reifier")),
        }
    }

    // =========================================================================
    // VALUES
    // =========================================================================

    /// Set the value of the occurrence, name or variant under
    /// construction. A later call overrides an earlier one. Names take
    /// no datatype.
    pub fn value(&mut self, value: &str, datatype: Option<Locator>) -> Result<(), TomaError> {
        match self.state()? {
            State::Occurrence | State::Name | State::Variant => {}
            _ => return Err(self.misplaced("value")),
        }
        match self.frames.last_mut() {
            Some(Frame::Occurrence(p)) => {
                p.value = Some((value.to_string(), datatype));
                Ok(())
            }
            Some(Frame::Name(p)) => {
                if datatype.is_some() {
                    return Err(TomaError::Protocol(
                        "names carry xsd:string values only".to_string(),
                    ));
                }
                p.value = Some(value.to_string());
                Ok(())
            }
            Some(Frame::Variant(p)) => {
                p.value = Some((value.to_string(), datatype));
                Ok(())
            }
            _ => Err(TomaError::InternalInvariant(
                "value state without valued frame".to_string(),
            )),
        }
    }

    // =========================================================================
    // OCCURRENCES
    // =========================================================================

    /// Open an occurrence on the current topic.
    pub fn start_occurrence(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Topic {
            return Err(self.misplaced("start_occurrence"));
        }
        let parent = self.current_topic()?;
        self.states.push(State::Occurrence);
        self.frames.push(Frame::Occurrence(PendingOccurrence {
            parent,
            typ: None,
            value: None,
            themes: Vec::new(),
            reifier: None,
            item_identifiers: Vec::new(),
        }));
        Ok(())
    }

    /// Close and materialize the occurrence. A missing value lands as
    /// the empty string.
    pub fn end_occurrence(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Occurrence {
            return Err(self.misplaced("end_occurrence"));
        }
        self.states.pop();
        let pending = match self.frames.pop() {
            Some(Frame::Occurrence(p)) => p,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "occurrence state without frame".to_string(),
                ));
            }
        };
        let scope = self.map.intern_scope(&pending.themes)?;
        let (value, datatype) = pending.value.unwrap_or((String::new(), None));
        let occurrence = self.map.create_occurrence(
            pending.parent,
            pending.typ,
            &value,
            datatype.as_ref(),
            scope,
        )?;
        for locator in pending.item_identifiers {
            self.map.add_item_identifier(occurrence, locator)?;
        }
        self.map.set_reifier(occurrence, pending.reifier)?;
        Ok(())
    }

    // =========================================================================
    // NAMES AND VARIANTS
    // =========================================================================

    /// Open a name on the current topic.
    pub fn start_name(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Topic {
            return Err(self.misplaced("start_name"));
        }
        let parent = self.current_topic()?;
        self.states.push(State::Name);
        self.frames.push(Frame::Name(PendingName {
            parent,
            typ: None,
            value: None,
            themes: Vec::new(),
            reifier: None,
            item_identifiers: Vec::new(),
            variants: Vec::new(),
        }));
        Ok(())
    }

    /// Close and materialize the name with its buffered variants. An
    /// untyped name gets the default name type.
    pub fn end_name(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Name {
            return Err(self.misplaced("end_name"));
        }
        self.states.pop();
        let pending = match self.frames.pop() {
            Some(Frame::Name(p)) => p,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "name state without frame".to_string(),
                ));
            }
        };
        let typ = match pending.typ {
            Some(t) => t,
            None => self
                .map
                .ensure_topic(&IdentityRef::subject_identifier(PSI_TOPIC_NAME))?,
        };
        self.apply_merges();
        let scope = self.map.intern_scope(&pending.themes)?;
        let value = pending.value.unwrap_or_default();
        let name = self
            .map
            .create_name(pending.parent, Some(typ), &value, scope)?;
        for locator in pending.item_identifiers {
            self.map.add_item_identifier(name, locator)?;
        }
        self.map.set_reifier(name, pending.reifier)?;
        for variant in pending.variants {
            let scope = self.map.intern_scope(&variant.themes)?;
            let (value, datatype) = variant.value.unwrap_or((String::new(), None));
            let created = self
                .map
                .create_variant(name, &value, datatype.as_ref(), scope)?;
            for locator in variant.item_identifiers {
                self.map.add_item_identifier(created, locator)?;
            }
            self.map.set_reifier(created, variant.reifier)?;
        }
        Ok(())
    }

    /// Open a variant on the current name.
    pub fn start_variant(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Name {
            return Err(self.misplaced("start_variant"));
        }
        self.states.push(State::Variant);
        self.frames.push(Frame::Variant(PendingVariant::default()));
        Ok(())
    }

    /// Close the variant, buffering it on the enclosing name. A variant
    /// without themes of its own is a protocol error.
    pub fn end_variant(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Variant {
            return Err(self.misplaced("end_variant"));
        }
        self.states.pop();
        let pending = match self.frames.pop() {
            Some(Frame::Variant(p)) => p,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "variant state without frame".to_string(),
                ));
            }
        };
        if pending.themes.is_empty() {
            return Err(TomaError::Protocol(
                "variant requires a non-empty scope".to_string(),
            ));
        }
        match self.frames.last_mut() {
            Some(Frame::Name(name)) => {
                name.variants.push(pending);
                Ok(())
            }
            _ => Err(TomaError::InternalInvariant(
                "variant closed outside a name".to_string(),
            )),
        }
    }

    // =========================================================================
    // ASSOCIATIONS AND ROLES
    // =========================================================================

    /// Open an association.
    pub fn start_association(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Map {
            return Err(self.misplaced("start_association"));
        }
        self.states.push(State::Association);
        self.frames.push(Frame::Association(PendingAssociation::default()));
        Ok(())
    }

    /// Close and materialize the association with its roles.
    pub fn end_association(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Association {
            return Err(self.misplaced("end_association"));
        }
        self.states.pop();
        let pending = match self.frames.pop() {
            Some(Frame::Association(p)) => p,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "association state without frame".to_string(),
                ));
            }
        };
        let scope = self.map.intern_scope(&pending.themes)?;
        let association = self.map.create_association(pending.typ, scope)?;
        for role in pending.roles {
            let typ = role
                .typ
                .ok_or_else(|| TomaError::Protocol("role requires a type".to_string()))?;
            let player = role
                .player
                .ok_or_else(|| TomaError::Protocol("role requires a player".to_string()))?;
            let created = self.map.create_role(association, typ, player)?;
            for locator in role.item_identifiers {
                self.map.add_item_identifier(created, locator)?;
            }
            self.map.set_reifier(created, role.reifier)?;
        }
        for locator in pending.item_identifiers {
            self.map.add_item_identifier(association, locator)?;
        }
        self.map.set_reifier(association, pending.reifier)?;
        Ok(())
    }

    /// Open a role in the current association.
    pub fn start_role(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Association {
            return Err(self.misplaced("start_role"));
        }
        self.states.push(State::Role);
        self.frames.push(Frame::Role(PendingRole::default()));
        Ok(())
    }

    /// Close the role, buffering it on the enclosing association.
    pub fn end_role(&mut self) -> Result<(), TomaError> {
        if self.state()? != State::Role {
            return Err(self.misplaced("end_role"));
        }
        self.states.pop();
        let pending = match self.frames.pop() {
            Some(Frame::Role(p)) => p,
            _ => {
                return Err(TomaError::InternalInvariant(
                    "role state without frame".to_string(),
                ));
            }
        };
        if pending.player.is_none() {
            return Err(TomaError::Protocol("role requires a player".to_string()));
        }
        match self.frames.last_mut() {
            Some(Frame::Association(assoc)) => {
                assoc.roles.push(pending);
                Ok(())
            }
            _ => Err(TomaError::InternalInvariant(
                "role closed outside an association".to_string(),
            )),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScopeId;

    fn si(s: &str) -> IdentityRef {
        IdentityRef::subject_identifier(s)
    }

    fn loc(s: &str) -> Locator {
        Locator::new(s)
    }

    #[test]
    fn builds_topic_with_name_and_occurrence() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start map");
        b.start_topic(&si("http://puccini")).expect("topic");
        b.start_name().expect("name");
        b.value("Giacomo Puccini", None).expect("value");
        b.end_name().expect("end name");
        b.start_occurrence().expect("occ");
        b.start_type().expect("type");
        b.start_topic(&si("http://born")).expect("type topic");
        b.end_topic().expect("end type topic");
        b.end_type().expect("end type");
        b.value("1858-06-22", None).expect("value");
        b.end_occurrence().expect("end occ");
        b.end_topic().expect("end topic");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        let t = map
            .topic_by_subject_identifier(&loc("http://puccini"))
            .expect("topic");
        let data = map.topic(t).expect("t");
        assert_eq!(data.names.len(), 1);
        assert_eq!(data.occurrences.len(), 1);
        let name = *data.names.iter().next().expect("name");
        // Untyped names get the default name type.
        let typ = map.name(name).expect("name").typ.expect("typ");
        assert!(
            map.topic(typ)
                .expect("typ")
                .subject_identifiers
                .contains(&loc(PSI_TOPIC_NAME))
        );
    }

    #[test]
    fn second_start_topic_with_known_identity_reuses_the_topic() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://a")).expect("topic");
        b.end_topic().expect("end");
        b.start_topic(&si("http://a")).expect("topic again");
        b.start_name().expect("name");
        b.value("n", None).expect("value");
        b.end_name().expect("end name");
        b.end_topic().expect("end");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");
        // PSI name-type topic plus the one subject topic.
        assert_eq!(map.topic_count(), 2);
    }

    #[test]
    fn merge_mid_stream_rewrites_the_open_topic() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        // First topic, fully built.
        b.start_topic(&si("http://a")).expect("topic");
        b.start_occurrence().expect("occ");
        b.value("existing", None).expect("value");
        b.end_occurrence().expect("end occ");
        b.end_topic().expect("end");
        // Second topic under a different identity gains the first one's
        // identifier mid-stream: the two merge while still open.
        b.start_topic(&si("http://b")).expect("topic");
        b.subject_identifier(loc("http://a")).expect("merge");
        b.start_name().expect("name");
        b.value("landed on survivor", None).expect("value");
        b.end_name().expect("end name");
        b.end_topic().expect("end");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        // The merged subject topic plus the default name-type topic.
        assert_eq!(map.topic_count(), 2);
        let t = map
            .topic_by_subject_identifier(&loc("http://a"))
            .expect("survivor");
        assert_eq!(map.topic_by_subject_identifier(&loc("http://b")), Some(t));
        let data = map.topic(t).expect("t");
        assert_eq!(data.occurrences.len(), 1);
        assert_eq!(data.names.len(), 1);
    }

    #[test]
    fn merge_mid_stream_rewrites_buffered_association_frames() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://doomed")).expect("topic");
        b.end_topic().expect("end");

        b.start_association().expect("assoc");
        b.start_type().expect("type");
        b.start_topic(&si("http://at")).expect("at");
        b.end_topic().expect("end at");
        b.end_type().expect("end type");
        b.start_role().expect("role");
        b.start_type().expect("rt");
        b.start_topic(&si("http://rt")).expect("rt");
        b.end_topic().expect("end rt");
        b.end_type().expect("end rt");
        b.start_player().expect("player");
        // The player topic merges with the doomed one while the role is
        // still buffered in the association frame.
        b.start_topic(&si("http://player")).expect("player topic");
        b.subject_identifier(loc("http://doomed")).expect("merge");
        b.end_topic().expect("end player topic");
        b.end_player().expect("end player");
        b.end_role().expect("end role");
        b.end_association().expect("end assoc");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        let survivor = map
            .topic_by_subject_identifier(&loc("http://player"))
            .expect("survivor");
        assert_eq!(map.association_count(), 1);
        let assoc = map.associations().next().expect("assoc");
        let role = *map
            .association(assoc)
            .expect("assoc")
            .roles
            .iter()
            .next()
            .expect("role");
        assert_eq!(map.role(role).expect("role").player, survivor);
    }

    #[test]
    fn scoped_name_collects_themes() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://t")).expect("topic");
        b.start_name().expect("name");
        b.value("n", None).expect("value");
        b.start_scope().expect("scope");
        b.start_topic(&si("http://english")).expect("theme");
        b.end_topic().expect("end theme");
        b.start_topic(&si("http://formal")).expect("theme");
        b.end_topic().expect("end theme");
        b.end_scope().expect("end scope");
        b.end_name().expect("end name");
        b.end_topic().expect("end topic");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        let t = map.topic_by_subject_identifier(&loc("http://t")).expect("t");
        let name = *map.topic(t).expect("t").names.iter().next().expect("name");
        let scope = map.name(name).expect("name").scope;
        assert_eq!(map.themes(scope).len(), 2);
    }

    #[test]
    fn variant_without_scope_is_a_protocol_error() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://t")).expect("topic");
        b.start_name().expect("name");
        b.value("n", None).expect("value");
        b.start_variant().expect("variant");
        b.value("v", None).expect("value");
        assert!(matches!(b.end_variant(), Err(TomaError::Protocol(_))));
    }

    #[test]
    fn variants_reject_streamed_types() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://t")).expect("topic");
        b.start_name().expect("name");
        b.value("n", None).expect("value");
        b.start_variant().expect("variant");
        assert!(matches!(b.start_type(), Err(TomaError::Protocol(_))));
    }

    #[test]
    fn reifier_on_topic_merges_the_referenced_topic() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://other")).expect("other");
        b.end_topic().expect("end");
        b.start_topic(&si("http://t")).expect("topic");
        b.start_reifier().expect("reifier");
        b.start_topic(&si("http://other")).expect("ref");
        b.end_topic().expect("end ref");
        b.end_reifier().expect("end reifier");
        b.end_topic().expect("end topic");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        assert_eq!(map.topic_count(), 1);
        let t = map.topic_by_subject_identifier(&loc("http://t")).expect("t");
        assert_eq!(map.topic_by_subject_identifier(&loc("http://other")), Some(t));
    }

    #[test]
    fn type_instance_associations_normalize_to_topic_types() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_association().expect("assoc");
        b.start_type().expect("type");
        b.start_topic(&si(PSI_TYPE_INSTANCE)).expect("ti");
        b.end_topic().expect("end");
        b.end_type().expect("end type");
        b.start_role().expect("role");
        b.start_type().expect("rt");
        b.start_topic(&si(PSI_TYPE)).expect("type role");
        b.end_topic().expect("end");
        b.end_type().expect("end");
        b.start_player().expect("player");
        b.start_topic(&si("http://composer")).expect("composer");
        b.end_topic().expect("end");
        b.end_player().expect("end player");
        b.end_role().expect("end role");
        b.start_role().expect("role");
        b.start_type().expect("rt");
        b.start_topic(&si(PSI_INSTANCE)).expect("instance role");
        b.end_topic().expect("end");
        b.end_type().expect("end");
        b.start_player().expect("player");
        b.start_topic(&si("http://puccini")).expect("puccini");
        b.end_topic().expect("end");
        b.end_player().expect("end player");
        b.end_role().expect("end role");
        b.end_association().expect("end assoc");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        let puccini = map
            .topic_by_subject_identifier(&loc("http://puccini"))
            .expect("topic");
        let composer = map
            .topic_by_subject_identifier(&loc("http://composer"))
            .expect("topic");
        assert!(map.topic(puccini).expect("t").types.contains(&composer));
        assert_eq!(map.association_count(), 0);
    }

    #[test]
    fn scoped_type_instance_associations_are_left_alone() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_association().expect("assoc");
        b.start_type().expect("type");
        b.start_topic(&si(PSI_TYPE_INSTANCE)).expect("ti");
        b.end_topic().expect("end");
        b.end_type().expect("end type");
        b.start_scope().expect("scope");
        b.start_topic(&si("http://theme")).expect("theme");
        b.end_topic().expect("end");
        b.end_scope().expect("end scope");
        b.start_role().expect("role");
        b.start_type().expect("rt");
        b.start_topic(&si(PSI_TYPE)).expect("tr");
        b.end_topic().expect("end");
        b.end_type().expect("end");
        b.start_player().expect("p");
        b.start_topic(&si("http://a")).expect("a");
        b.end_topic().expect("end");
        b.end_player().expect("end");
        b.end_role().expect("end role");
        b.start_role().expect("role");
        b.start_type().expect("rt");
        b.start_topic(&si(PSI_INSTANCE)).expect("ir");
        b.end_topic().expect("end");
        b.end_type().expect("end");
        b.start_player().expect("p");
        b.start_topic(&si("http://b")).expect("b");
        b.end_topic().expect("end");
        b.end_player().expect("end");
        b.end_role().expect("end role");
        b.end_association().expect("end assoc");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        assert_eq!(map.association_count(), 1);
        let assoc = map.associations().next().expect("assoc");
        assert_ne!(map.association(assoc).expect("a").scope, ScopeId::UNCONSTRAINED);
    }

    #[test]
    fn misplaced_operations_are_protocol_errors() {
        let mut b = MapBuilder::new();
        assert!(matches!(b.start_topic(&si("http://t")), Err(TomaError::Protocol(_))));
        b.start_topic_map().expect("start");
        assert!(matches!(b.start_role(), Err(TomaError::Protocol(_))));
        assert!(matches!(b.value("v", None), Err(TomaError::Protocol(_))));
        b.start_topic(&si("http://t")).expect("topic");
        assert!(matches!(b.start_association(), Err(TomaError::Protocol(_))));
    }

    #[test]
    fn unclosed_stream_cannot_finish() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://t")).expect("topic");
        assert!(matches!(b.finish(), Err(TomaError::Protocol(_))));
    }

    #[test]
    fn builds_into_an_existing_map() {
        let mut existing = TopicMap::new();
        let t = existing.create_topic();
        existing
            .add_subject_identifier(t, loc("http://shared"))
            .expect("si");

        let mut b = MapBuilder::with_map(existing);
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://shared")).expect("topic");
        b.start_name().expect("name");
        b.value("n", None).expect("value");
        b.end_name().expect("end name");
        b.end_topic().expect("end");
        b.end_topic_map().expect("end");
        let map = b.finish().expect("finish");

        assert_eq!(map.topic(t).expect("t").names.len(), 1);
    }

    #[test]
    fn topic_ref_fills_type_player_and_theme_slots() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_association().expect("assoc");
        b.start_type().expect("type");
        b.topic_ref(&si("http://composed")).expect("ref");
        b.end_type().expect("end type");
        b.start_scope().expect("scope");
        b.start_theme().expect("theme");
        b.topic_ref(&si("http://italian")).expect("ref");
        b.end_theme().expect("end theme");
        b.end_scope().expect("end scope");
        b.start_role().expect("role");
        b.start_type().expect("rt");
        b.topic_ref(&si("http://composer")).expect("ref");
        b.end_type().expect("end rt");
        b.start_player().expect("player");
        b.topic_ref(&si("http://puccini")).expect("ref");
        b.end_player().expect("end player");
        b.end_role().expect("end role");
        b.end_association().expect("end assoc");
        b.end_topic_map().expect("end map");
        let map = b.finish().expect("finish");

        let typ = map
            .topic_by_subject_identifier(&loc("http://composed"))
            .expect("type");
        let assoc = *map
            .instances_of(typ)
            .iter()
            .next()
            .expect("association");
        let theme = map
            .topic_by_subject_identifier(&loc("http://italian"))
            .expect("theme");
        let data = map.association(assoc).expect("assoc");
        assert!(map.themes(data.scope).contains(&theme));
        let role = *data.roles.iter().next().expect("role");
        let player = map
            .topic_by_subject_identifier(&loc("http://puccini"))
            .expect("player");
        assert_eq!(map.role(role).expect("role").player, player);
    }

    #[test]
    fn theme_slot_requires_exactly_one_topic() {
        let mut b = MapBuilder::new();
        b.start_topic_map().expect("start");
        b.start_topic(&si("http://t")).expect("topic");
        b.start_name().expect("name");
        b.value("n", None).expect("value");
        b.start_scope().expect("scope");
        b.start_theme().expect("theme");
        assert!(matches!(b.end_theme(), Err(TomaError::Protocol(_))));
        b.topic_ref(&si("http://a")).expect("ref");
        assert!(matches!(
            b.topic_ref(&si("http://b")),
            Err(TomaError::Protocol(_))
        ));
        b.end_theme().expect("end theme");
        b.end_scope().expect("end scope");
        b.end_name().expect("end name");
        b.end_topic().expect("end topic");
        b.end_topic_map().expect("end map");
    }
}
