//! # Merge Engine
//!
//! Topic merging, whole-map merging, and duplicate folding.
//!
//! A topic merge funnels everything the doomed topic carries onto the
//! survivor: identities, type-set, characteristics, played roles, and
//! every inbound reference (as type, as theme, as reifier). Characteristics
//! and associations that become structurally equal afterwards are folded
//! by signature. Merging is allowed to cascade: folding two reified
//! duplicates merges their reifier topics, which can trigger further
//! folding. Each cascade step removes a topic, so the process terminates.
//!
//! All merges are recorded in the owning map's merge log so the streaming
//! builder can rewrite handles it still holds.

use crate::graph::TopicMap;
use crate::literal::Literal;
use crate::signature::{self, Signature};
use crate::types::{ConstructId, ConstructKind, ScopeId, TomaError};
use std::collections::{BTreeMap, BTreeSet};

/// Stateless entry points for merging and duplicate folding.
pub struct MergeEngine;

impl MergeEngine {
    // =========================================================================
    // TOPIC MERGE
    // =========================================================================

    /// Merge `source` into `target` and return the survivor.
    ///
    /// Merging a topic with itself is a no-op. The merge is rejected
    /// before any mutation when both topics reify distinct constructs;
    /// on rejection the graph is unchanged.
    pub fn merge_topics(
        map: &mut TopicMap,
        source: ConstructId,
        mut target: ConstructId,
    ) -> Result<ConstructId, TomaError> {
        if source == target {
            return Ok(target);
        }
        map.topic(source)?;
        map.topic(target)?;
        map.ensure_indexes_live();

        // Precondition: a topic reifies at most one construct, so two
        // topics reifying different constructs cannot become one.
        let source_reified = map.topic(source)?.reified;
        let target_reified = map.topic(target)?.reified;
        if let (Some(existing), Some(incoming)) = (target_reified, source_reified)
            && existing != incoming
        {
            return Err(TomaError::ReificationConflict { existing, incoming });
        }

        // Identities move first so the survivor answers every lookup the
        // doomed topic used to answer.
        let data = map.topic(source)?;
        let sis: Vec<_> = data.subject_identifiers.iter().cloned().collect();
        let sls: Vec<_> = data.subject_locators.iter().cloned().collect();
        let iis: Vec<_> = data.item_identifiers.iter().cloned().collect();
        for locator in sis {
            map.remove_subject_identifier(source, &locator)?;
            target = map.add_subject_identifier(target, locator)?;
        }
        for locator in sls {
            map.remove_subject_locator(source, &locator)?;
            target = map.add_subject_locator(target, locator)?;
        }
        for locator in iis {
            map.remove_item_identifier(source, &locator)?;
            target = map.add_item_identifier(target, locator)?;
        }
        // A nested merge fired by the re-adds can cascade far enough to
        // consume the doomed topic itself.
        if !map.contains(source) {
            return Ok(map.current_handle(target));
        }

        // Reification transfers to the survivor.
        if let Some(construct) = source_reified {
            map.set_reifier(construct, None)?;
            map.set_reifier(construct, Some(target))?;
        }

        // Every construct typed by the doomed topic re-points.
        for instance in map.instances_of(source) {
            if instance == source {
                continue;
            }
            match map.kind_of(instance)? {
                ConstructKind::Topic => {
                    map.remove_topic_type(instance, source)?;
                    map.add_topic_type(instance, target)?;
                }
                _ => map.set_type(instance, Some(target))?,
            }
        }

        // Every scope using the doomed topic as theme re-points.
        for scoped in map.scoped_by_theme(source) {
            map.repoint_theme(scoped, source, target)?;
        }

        // Type-sets union, with the doomed handle rewritten.
        for typ in map.topic(source)?.types.clone() {
            map.remove_topic_type(source, typ)?;
            let typ = if typ == source { target } else { typ };
            map.add_topic_type(target, typ)?;
        }

        // Roles played re-point onto the survivor.
        for role in map.topic(source)?.roles_played.clone() {
            map.set_player(role, target)?;
        }

        // Characteristics move over, folding structural duplicates. A
        // fold can cascade into a merge that dooms either side of this
        // one; when that happens the cascade has already finished the
        // job and the stale handle must not be touched again.
        target = Self::absorb_occurrences(map, source, target)?;
        if !map.contains(source) {
            return Ok(map.current_handle(target));
        }
        target = Self::absorb_names(map, source, target)?;
        if !map.contains(source) {
            return Ok(map.current_handle(target));
        }

        // Associations around the survivor may now be duplicates.
        target = Self::fold_associations_around(map, target)?;

        map.remove_construct(source)?;
        map.log_merge(source, target);
        Ok(target)
    }

    fn absorb_occurrences(
        map: &mut TopicMap,
        source: ConstructId,
        mut target: ConstructId,
    ) -> Result<ConstructId, TomaError> {
        let mut keeper_sigs = Self::occurrence_sigs(map, target)?;
        for occurrence in map.topic(source)?.occurrences.clone() {
            if !map.contains(occurrence) {
                continue;
            }
            let sig = signature::occurrence(map, occurrence)?;
            if let Some(&keeper) = keeper_sigs.get(&sig) {
                if Self::fold_valued(map, occurrence, keeper)? {
                    // A reifier merge may have re-pointed types or
                    // themes, or doomed the survivor itself.
                    target = map.current_handle(target);
                    if !map.contains(source) {
                        return Ok(target);
                    }
                    keeper_sigs = Self::occurrence_sigs(map, target)?;
                }
            } else {
                map.reparent_characteristic(occurrence, target)?;
                keeper_sigs.insert(sig, occurrence);
            }
        }
        Ok(target)
    }

    fn absorb_names(
        map: &mut TopicMap,
        source: ConstructId,
        mut target: ConstructId,
    ) -> Result<ConstructId, TomaError> {
        let mut keeper_sigs = Self::name_sigs(map, target)?;
        for name in map.topic(source)?.names.clone() {
            if !map.contains(name) {
                continue;
            }
            let sig = signature::name(map, name)?;
            if let Some(&keeper) = keeper_sigs.get(&sig) {
                if Self::fold_name(map, name, keeper)? {
                    target = map.current_handle(target);
                    if !map.contains(source) {
                        return Ok(target);
                    }
                    keeper_sigs = Self::name_sigs(map, target)?;
                }
            } else {
                map.reparent_characteristic(name, target)?;
                keeper_sigs.insert(sig, name);
            }
        }
        Ok(target)
    }

    fn occurrence_sigs(
        map: &TopicMap,
        topic: ConstructId,
    ) -> Result<BTreeMap<Signature, ConstructId>, TomaError> {
        let mut sigs = BTreeMap::new();
        for &occurrence in &map.topic(topic)?.occurrences {
            sigs.entry(signature::occurrence(map, occurrence)?)
                .or_insert(occurrence);
        }
        Ok(sigs)
    }

    fn name_sigs(
        map: &TopicMap,
        topic: ConstructId,
    ) -> Result<BTreeMap<Signature, ConstructId>, TomaError> {
        let mut sigs = BTreeMap::new();
        for &name in &map.topic(topic)?.names {
            sigs.entry(signature::name(map, name)?).or_insert(name);
        }
        Ok(sigs)
    }

    fn variant_sigs(
        map: &TopicMap,
        name: ConstructId,
    ) -> Result<BTreeMap<Signature, ConstructId>, TomaError> {
        let mut sigs = BTreeMap::new();
        for &variant in &map.name(name)?.variants {
            sigs.entry(signature::variant(map, variant)?).or_insert(variant);
        }
        Ok(sigs)
    }

    // =========================================================================
    // DUPLICATE FOLDING
    // =========================================================================

    /// Fold a duplicate occurrence or variant into its keeper: item
    /// identifiers move, reifiers fold, the doomed construct goes away.
    /// Returns whether a reifier merge cascaded.
    fn fold_valued(
        map: &mut TopicMap,
        doomed: ConstructId,
        keeper: ConstructId,
    ) -> Result<bool, TomaError> {
        Self::move_item_identifiers(map, doomed, keeper)?;
        let merged = Self::fold_reifiers(map, doomed, keeper)?;
        // A reifier merge can take the doomed construct with it when its
        // parent topic is on the doomed side.
        if map.contains(doomed) {
            map.remove_construct(doomed)?;
        }
        Ok(merged)
    }

    /// Fold a duplicate name into its keeper, folding variants first so
    /// none are lost with the doomed name.
    fn fold_name(
        map: &mut TopicMap,
        doomed: ConstructId,
        keeper: ConstructId,
    ) -> Result<bool, TomaError> {
        let mut merged = false;
        let mut keeper_sigs = Self::variant_sigs(map, keeper)?;
        for variant in map.name(doomed)?.variants.clone() {
            if !map.contains(variant) {
                continue;
            }
            let sig = signature::variant(map, variant)?;
            if let Some(&kept) = keeper_sigs.get(&sig) {
                if Self::fold_valued(map, variant, kept)? {
                    merged = true;
                    if !map.contains(keeper) || !map.contains(doomed) {
                        break;
                    }
                    keeper_sigs = Self::variant_sigs(map, keeper)?;
                }
            } else {
                map.reparent_variant(variant, keeper)?;
                keeper_sigs.insert(sig, variant);
            }
        }
        if map.contains(doomed) && map.contains(keeper) {
            Self::move_item_identifiers(map, doomed, keeper)?;
            merged |= Self::fold_reifiers(map, doomed, keeper)?;
        }
        if map.contains(doomed) {
            map.remove_construct(doomed)?;
        }
        Ok(merged)
    }

    /// Fold a duplicate association into its keeper. Roles are matched
    /// pairwise by signature so role-level identifiers and reifiers
    /// survive the fold.
    fn fold_association(
        map: &mut TopicMap,
        doomed: ConstructId,
        keeper: ConstructId,
    ) -> Result<bool, TomaError> {
        let mut merged = false;
        let mut pool: BTreeMap<Signature, Vec<ConstructId>> = BTreeMap::new();
        for &role in &map.association(keeper)?.roles.clone() {
            pool.entry(signature::role(map, role)?).or_default().push(role);
        }
        let mut matches = Vec::new();
        for role in map.association(doomed)?.roles.clone() {
            let sig = signature::role(map, role)?;
            if let Some(counterpart) = pool.get_mut(&sig).and_then(Vec::pop) {
                matches.push((role, counterpart));
            }
        }
        for (doomed_role, keeper_role) in matches {
            if !map.contains(doomed_role) || !map.contains(keeper_role) {
                continue;
            }
            Self::move_item_identifiers(map, doomed_role, keeper_role)?;
            merged |= Self::fold_reifiers(map, doomed_role, keeper_role)?;
        }
        if map.contains(doomed) && map.contains(keeper) {
            Self::move_item_identifiers(map, doomed, keeper)?;
            merged |= Self::fold_reifiers(map, doomed, keeper)?;
        }
        if map.contains(doomed) {
            map.remove_construct(doomed)?;
        }
        Ok(merged)
    }

    /// Fold the reifiers of two constructs about to become one. A lone
    /// reifier re-points; two distinct reifiers merge as topics. Returns
    /// whether a topic merge happened.
    fn fold_reifiers(
        map: &mut TopicMap,
        doomed: ConstructId,
        keeper: ConstructId,
    ) -> Result<bool, TomaError> {
        let doomed_reifier = map.reifier_of(doomed)?;
        let keeper_reifier = map.reifier_of(keeper)?;
        match (doomed_reifier, keeper_reifier) {
            (None, _) => Ok(false),
            (Some(reifier), None) => {
                map.set_reifier(doomed, None)?;
                map.set_reifier(keeper, Some(reifier))?;
                Ok(false)
            }
            (Some(a), Some(b)) => {
                map.set_reifier(doomed, None)?;
                Self::merge_topics(map, a, b)?;
                Ok(true)
            }
        }
    }

    fn move_item_identifiers(
        map: &mut TopicMap,
        from: ConstructId,
        to: ConstructId,
    ) -> Result<(), TomaError> {
        for locator in map.construct(from)?.item_identifiers().clone() {
            map.remove_item_identifier(from, &locator)?;
            map.add_item_identifier(to, locator)?;
        }
        Ok(())
    }

    /// Fold duplicate associations in the neighborhood of one topic:
    /// associations it plays in, is type of, or themes.
    fn fold_associations_around(
        map: &mut TopicMap,
        topic: ConstructId,
    ) -> Result<ConstructId, TomaError> {
        map.ensure_indexes_live();
        let mut candidates = BTreeSet::new();
        for role in map.topic(topic)?.roles_played.clone() {
            candidates.insert(map.role(role)?.parent);
        }
        for instance in map.instances_of(topic) {
            if map.kind_of(instance)? == ConstructKind::Association {
                candidates.insert(instance);
            }
        }
        for scoped in map.scoped_by_theme(topic) {
            if map.kind_of(scoped)? == ConstructKind::Association {
                candidates.insert(scoped);
            }
        }
        Self::fold_candidate_associations(map, candidates)?;
        Ok(map.current_handle(topic))
    }

    fn fold_candidate_associations(
        map: &mut TopicMap,
        candidates: BTreeSet<ConstructId>,
    ) -> Result<(), TomaError> {
        let mut keepers: BTreeMap<Signature, ConstructId> = BTreeMap::new();
        let mut pending: Vec<ConstructId> = candidates.into_iter().collect();
        while let Some(assoc) = pending.pop() {
            if !map.contains(assoc) {
                continue;
            }
            let sig = signature::association(map, assoc)?;
            if let Some(&keeper) = keepers.get(&sig) {
                if Self::fold_association(map, assoc, keeper)? {
                    // Cascaded merges can reshape already-seen keepers;
                    // start the pass over on what survives.
                    keepers.clear();
                    pending = map.associations().collect();
                }
            } else {
                keepers.insert(sig, assoc);
            }
        }
        Ok(())
    }

    // =========================================================================
    // EXPLICIT DEDUPLICATION
    // =========================================================================

    /// Fold all duplicate occurrences, names and variants of one topic.
    pub fn remove_duplicates(map: &mut TopicMap, topic: ConstructId) -> Result<(), TomaError> {
        let mut keeper_sigs = Self::occurrence_sigs(map, topic)?;
        for occurrence in map.topic(topic)?.occurrences.clone() {
            if !map.contains(occurrence) {
                continue;
            }
            let sig = signature::occurrence(map, occurrence)?;
            match keeper_sigs.get(&sig) {
                Some(&keeper) if keeper != occurrence => {
                    if Self::fold_valued(map, occurrence, keeper)? {
                        keeper_sigs = Self::occurrence_sigs(map, topic)?;
                    }
                }
                _ => {}
            }
        }
        let mut keeper_sigs = Self::name_sigs(map, topic)?;
        for name in map.topic(topic)?.names.clone() {
            if !map.contains(name) {
                continue;
            }
            let sig = signature::name(map, name)?;
            match keeper_sigs.get(&sig) {
                Some(&keeper) if keeper != name => {
                    if Self::fold_name(map, name, keeper)? {
                        keeper_sigs = Self::name_sigs(map, topic)?;
                    }
                }
                _ => {
                    // Variants of a kept name can still be duplicates of
                    // each other.
                    let mut variant_sigs = Self::variant_sigs(map, name)?;
                    for variant in map.name(name)?.variants.clone() {
                        if !map.contains(variant) {
                            continue;
                        }
                        let vsig = signature::variant(map, variant)?;
                        if let Some(&kept) = variant_sigs.get(&vsig)
                            && kept != variant
                            && Self::fold_valued(map, variant, kept)?
                        {
                            variant_sigs = Self::variant_sigs(map, name)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold all duplicate associations in the map.
    pub fn remove_duplicate_associations(map: &mut TopicMap) -> Result<(), TomaError> {
        let candidates: BTreeSet<ConstructId> = map.associations().collect();
        Self::fold_candidate_associations(map, candidates)
    }

    // =========================================================================
    // MAP MERGE
    // =========================================================================

    /// Merge every construct of `source` into `target`.
    ///
    /// Topics are matched across maps by identity (with the subject-
    /// identifier ↔ item-identifier cross-check); everything else is
    /// copied, folding structural duplicates on arrival. Returns the
    /// source-topic → target-topic mapping.
    pub fn merge_maps(
        target: &mut TopicMap,
        source: &TopicMap,
    ) -> Result<BTreeMap<ConstructId, ConstructId>, TomaError> {
        let mut mapping = Self::match_topics(target, source)?;

        // Bulk load: secondary indexes catch up once at the end.
        target.suspend_secondary_indexes();

        // Stubs for unmatched topics, created before any content copy so
        // cyclic references (self-types, mutual players) resolve.
        for topic in source.topics() {
            if !mapping.contains_key(&topic) {
                let stub = target.create_topic();
                mapping.insert(topic, stub);
            }
        }

        Self::copy_identities(target, source, &mut mapping)?;
        Self::copy_types(target, source, &mut mapping)?;
        Self::copy_characteristics(target, source, &mut mapping)?;
        Self::copy_associations(target, source, &mut mapping)?;
        Self::copy_map_root(target, source, &mut mapping)?;

        target.ensure_indexes_live();
        Ok(mapping)
    }

    /// Copy a map into a fresh one. Handles are renumbered densely; the
    /// result carries the source's configuration.
    pub fn copy(source: &TopicMap) -> Result<TopicMap, TomaError> {
        let mut target = TopicMap::with_config(source.config());
        Self::merge_maps(&mut target, source)?;
        Ok(target)
    }

    /// Match source topics against target constructs by identity. Two
    /// target topics claimed by one source topic merge immediately;
    /// resolution onto a non-topic construct is a clash.
    fn match_topics(
        target: &mut TopicMap,
        source: &TopicMap,
    ) -> Result<BTreeMap<ConstructId, ConstructId>, TomaError> {
        let mut mapping: BTreeMap<ConstructId, ConstructId> = BTreeMap::new();
        for topic in source.topics() {
            let data = source.topic(topic)?;
            let mut resolved: BTreeSet<ConstructId> = BTreeSet::new();
            for locator in &data.subject_identifiers {
                if let Some(found) = target.topic_by_subject_identifier(locator) {
                    resolved.insert(found);
                }
                if let Some(found) = target.construct_by_item_identifier(locator) {
                    resolved.insert(found);
                }
            }
            for locator in &data.subject_locators {
                if let Some(found) = target.topic_by_subject_locator(locator) {
                    resolved.insert(found);
                }
            }
            for locator in &data.item_identifiers {
                if let Some(found) = target.construct_by_item_identifier(locator) {
                    resolved.insert(found);
                }
                if let Some(found) = target.topic_by_subject_identifier(locator) {
                    resolved.insert(found);
                }
            }
            for found in &resolved {
                if target.kind_of(*found)? != ConstructKind::Topic {
                    let locator = data
                        .subject_identifiers
                        .iter()
                        .chain(&data.item_identifiers)
                        .next()
                        .cloned()
                        .ok_or_else(|| {
                            TomaError::InternalInvariant(
                                "identity match without identities".to_string(),
                            )
                        })?;
                    return Err(TomaError::IdentityClash(locator));
                }
            }
            // One source topic claiming several target topics collapses
            // them before any content lands.
            let mut resolved = resolved.into_iter();
            if let Some(first) = resolved.next() {
                let mut survivor = first;
                for other in resolved {
                    let doomed = other;
                    survivor = Self::merge_topics(target, doomed, survivor)?;
                    Self::remap(&mut mapping, doomed, survivor);
                }
                mapping.insert(topic, survivor);
            }
        }
        Ok(mapping)
    }

    fn remap(
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
        doomed: ConstructId,
        survivor: ConstructId,
    ) {
        for value in mapping.values_mut() {
            if *value == doomed {
                *value = survivor;
            }
        }
    }

    fn mapped(
        mapping: &BTreeMap<ConstructId, ConstructId>,
        id: ConstructId,
    ) -> Result<ConstructId, TomaError> {
        mapping
            .get(&id)
            .copied()
            .ok_or(TomaError::ConstructNotFound(id))
    }

    fn copy_identities(
        target: &mut TopicMap,
        source: &TopicMap,
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
    ) -> Result<(), TomaError> {
        for topic in source.topics() {
            let data = source.topic(topic)?;
            let mut current = Self::mapped(mapping, topic)?;
            for locator in &data.subject_identifiers {
                let survivor = target.add_subject_identifier(current, locator.clone())?;
                if survivor != current {
                    Self::remap(mapping, current, survivor);
                    current = survivor;
                }
            }
            for locator in &data.subject_locators {
                let survivor = target.add_subject_locator(current, locator.clone())?;
                if survivor != current {
                    Self::remap(mapping, current, survivor);
                    current = survivor;
                }
            }
            for locator in &data.item_identifiers {
                let survivor = target.add_item_identifier(current, locator.clone())?;
                if survivor != current {
                    Self::remap(mapping, current, survivor);
                    current = survivor;
                }
            }
        }
        Ok(())
    }

    fn copy_types(
        target: &mut TopicMap,
        source: &TopicMap,
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
    ) -> Result<(), TomaError> {
        for topic in source.topics() {
            let to = Self::mapped(mapping, topic)?;
            for &typ in &source.topic(topic)?.types {
                let typ = Self::mapped(mapping, typ)?;
                target.add_topic_type(to, typ)?;
            }
        }
        Ok(())
    }

    fn map_scope(
        target: &mut TopicMap,
        source: &TopicMap,
        mapping: &BTreeMap<ConstructId, ConstructId>,
        scope: ScopeId,
    ) -> Result<ScopeId, TomaError> {
        let mut themes = Vec::new();
        for &theme in source.themes(scope) {
            themes.push(Self::mapped(mapping, theme)?);
        }
        target.intern_scope(&themes)
    }

    fn source_literal(source: &TopicMap, id: crate::types::LiteralId) -> Result<Literal, TomaError> {
        source
            .literal(id)
            .cloned()
            .ok_or_else(|| TomaError::InternalInvariant("dangling literal handle".to_string()))
    }

    /// Apply a copied reifier to a landed construct, folding with any
    /// reifier the target construct already carries.
    fn apply_reifier(
        target: &mut TopicMap,
        construct: ConstructId,
        reifier: Option<ConstructId>,
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
    ) -> Result<bool, TomaError> {
        let Some(reifier) = reifier else {
            return Ok(false);
        };
        let incoming = Self::mapped(mapping, reifier)?;
        match target.reifier_of(construct)? {
            None => {
                target.set_reifier(construct, Some(incoming))?;
                Ok(false)
            }
            Some(existing) if existing == incoming => Ok(false),
            Some(existing) => {
                let survivor = Self::merge_topics(target, incoming, existing)?;
                Self::remap(mapping, incoming, survivor);
                Ok(true)
            }
        }
    }

    fn copy_item_identifiers(
        target: &mut TopicMap,
        source_iis: &BTreeSet<crate::types::Locator>,
        construct: ConstructId,
    ) -> Result<(), TomaError> {
        for locator in source_iis {
            target.add_item_identifier(construct, locator.clone())?;
        }
        Ok(())
    }

    fn copy_characteristics(
        target: &mut TopicMap,
        source: &TopicMap,
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
    ) -> Result<(), TomaError> {
        for topic in source.topics() {
            let data = source.topic(topic)?;
            let occurrences: Vec<_> = data.occurrences.iter().copied().collect();
            let names: Vec<_> = data.names.iter().copied().collect();

            for occurrence in occurrences {
                let od = source.occurrence(occurrence)?.clone();
                let to = Self::mapped(mapping, topic)?;
                let typ = od.typ.map(|t| Self::mapped(mapping, t)).transpose()?;
                let scope = Self::map_scope(target, source, mapping, od.scope)?;
                let literal = Self::source_literal(source, od.value)?;
                let value = target.intern_literal(literal.clone())?;
                let sig = Signature::Occurrence { typ, scope, value };

                let landed = Self::occurrence_sigs(target, to)?
                    .get(&sig)
                    .copied();
                let landed = match landed {
                    Some(existing) => existing,
                    None => target.create_occurrence(
                        to,
                        typ,
                        &literal.value,
                        Some(&literal.datatype),
                        scope,
                    )?,
                };
                Self::copy_item_identifiers(target, &od.item_identifiers, landed)?;
                Self::apply_reifier(target, landed, od.reifier, mapping)?;
            }

            for name in names {
                let nd = source.name(name)?.clone();
                let to = Self::mapped(mapping, topic)?;
                let typ = nd.typ.map(|t| Self::mapped(mapping, t)).transpose()?;
                let scope = Self::map_scope(target, source, mapping, nd.scope)?;
                let literal = Self::source_literal(source, nd.value)?;
                let value = target.intern_literal(literal.clone())?;
                let sig = Signature::Name { typ, scope, value };

                let landed = Self::name_sigs(target, to)?.get(&sig).copied();
                let landed = match landed {
                    Some(existing) => existing,
                    None => target.create_name(to, typ, &literal.value, scope)?,
                };
                Self::copy_item_identifiers(target, &nd.item_identifiers, landed)?;
                Self::apply_reifier(target, landed, nd.reifier, mapping)?;

                for variant in nd.variants {
                    let vd = source.variant(variant)?.clone();
                    let vscope = Self::map_scope(target, source, mapping, vd.scope)?;
                    let vliteral = Self::source_literal(source, vd.value)?;
                    let vvalue = target.intern_literal(vliteral.clone())?;
                    let vsig = Signature::Variant {
                        scope: vscope,
                        value: vvalue,
                    };
                    let vlanded = Self::variant_sigs(target, landed)?.get(&vsig).copied();
                    let vlanded = match vlanded {
                        Some(existing) => existing,
                        None => target.create_variant(
                            landed,
                            &vliteral.value,
                            Some(&vliteral.datatype),
                            vscope,
                        )?,
                    };
                    Self::copy_item_identifiers(target, &vd.item_identifiers, vlanded)?;
                    Self::apply_reifier(target, vlanded, vd.reifier, mapping)?;
                }
            }
        }
        Ok(())
    }

    fn copy_associations(
        target: &mut TopicMap,
        source: &TopicMap,
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
    ) -> Result<(), TomaError> {
        // Existing target associations by signature, so arriving
        // duplicates fold instead of landing twice.
        let mut keepers: BTreeMap<Signature, ConstructId> = BTreeMap::new();
        for assoc in target.associations().collect::<Vec<_>>() {
            keepers
                .entry(signature::association(target, assoc)?)
                .or_insert(assoc);
        }

        for assoc in source.associations().collect::<Vec<_>>() {
            let ad = source.association(assoc)?.clone();
            let typ = ad.typ.map(|t| Self::mapped(mapping, t)).transpose()?;
            let scope = Self::map_scope(target, source, mapping, ad.scope)?;
            let mut role_parts = Vec::new();
            for &role in &ad.roles {
                let rd = source.role(role)?;
                role_parts.push((
                    role,
                    Self::mapped(mapping, rd.typ)?,
                    Self::mapped(mapping, rd.player)?,
                ));
            }
            let sig = signature::association_from_parts(
                typ,
                scope,
                role_parts.iter().map(|&(_, t, p)| (t, p)).collect(),
            );

            let landed = match keepers.get(&sig) {
                Some(&existing) => existing,
                None => {
                    let created = target.create_association(typ, scope)?;
                    for &(_, role_typ, player) in &role_parts {
                        target.create_role(created, role_typ, player)?;
                    }
                    keepers.insert(sig, created);
                    created
                }
            };

            // Role-level identifiers and reifiers land on the matching
            // target role.
            let mut pool: BTreeMap<Signature, Vec<ConstructId>> = BTreeMap::new();
            for &role in &target.association(landed)?.roles.clone() {
                pool.entry(signature::role(target, role)?).or_default().push(role);
            }
            let mut cascaded = false;
            for &(source_role, role_typ, player) in &role_parts {
                let rd = source.role(source_role)?.clone();
                let rsig = Signature::Role {
                    typ: role_typ,
                    player,
                };
                if let Some(counterpart) = pool.get_mut(&rsig).and_then(Vec::pop) {
                    Self::copy_item_identifiers(target, &rd.item_identifiers, counterpart)?;
                    cascaded |= Self::apply_reifier(target, counterpart, rd.reifier, mapping)?;
                }
            }
            Self::copy_item_identifiers(target, &ad.item_identifiers, landed)?;
            cascaded |= Self::apply_reifier(target, landed, ad.reifier, mapping)?;

            if cascaded {
                // Reifier merges can fold associations; rebuild the
                // keeper table from what actually survives.
                keepers.clear();
                for alive in target.associations().collect::<Vec<_>>() {
                    keepers
                        .entry(signature::association(target, alive)?)
                        .or_insert(alive);
                }
            }
        }
        Ok(())
    }

    fn copy_map_root(
        target: &mut TopicMap,
        source: &TopicMap,
        mapping: &mut BTreeMap<ConstructId, ConstructId>,
    ) -> Result<(), TomaError> {
        for locator in source.map_item_identifiers().clone() {
            target.add_item_identifier(ConstructId::TOPIC_MAP, locator)?;
        }
        Self::apply_reifier(target, ConstructId::TOPIC_MAP, source.map_reifier(), mapping)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Locator;

    fn loc(s: &str) -> Locator {
        Locator::new(s)
    }

    #[test]
    fn merge_unions_identities_and_types() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        let ta = map.create_topic();
        let tb = map.create_topic();
        map.add_subject_identifier(a, loc("http://a")).expect("si");
        map.add_subject_identifier(b, loc("http://b")).expect("si");
        map.add_topic_type(a, ta).expect("type");
        map.add_topic_type(b, tb).expect("type");

        let survivor = MergeEngine::merge_topics(&mut map, a, b).expect("merge");
        assert_eq!(survivor, b);
        assert!(!map.contains(a));
        let data = map.topic(b).expect("topic");
        assert!(data.subject_identifiers.contains(&loc("http://a")));
        assert!(data.subject_identifiers.contains(&loc("http://b")));
        assert!(data.types.contains(&ta));
        assert!(data.types.contains(&tb));
        assert_eq!(map.topic_by_subject_identifier(&loc("http://a")), Some(b));
    }

    #[test]
    fn merge_with_self_is_a_no_op() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        map.add_subject_identifier(a, loc("http://a")).expect("si");
        let survivor = MergeEngine::merge_topics(&mut map, a, a).expect("merge");
        assert_eq!(survivor, a);
        assert_eq!(map.topic_count(), 1);
    }

    #[test]
    fn merge_rejects_distinct_reified_constructs_without_mutation() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        map.add_subject_identifier(a, loc("http://a")).expect("si");
        let a1 = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        let a2 = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        map.set_reifier(a1, Some(a)).expect("reify");
        map.set_reifier(a2, Some(b)).expect("reify");

        let result = MergeEngine::merge_topics(&mut map, a, b);
        assert!(matches!(result, Err(TomaError::ReificationConflict { .. })));
        assert!(map.contains(a));
        assert_eq!(map.topic_by_subject_identifier(&loc("http://a")), Some(a));
        assert_eq!(map.reifier_of(a1).expect("reifier"), Some(a));
        assert_eq!(map.reifier_of(a2).expect("reifier"), Some(b));
    }

    #[test]
    fn merge_repoints_type_theme_and_player_references() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        let instance = map.create_topic();
        map.add_topic_type(instance, a).expect("type");

        let occ = map
            .create_occurrence(instance, Some(a), "v", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        let scope = map.intern_scope(&[a]).expect("scope");
        let name = map.create_name(instance, None, "n", scope).expect("name");

        let rt = map.create_topic();
        let assoc = map
            .create_association(None, ScopeId::UNCONSTRAINED)
            .expect("assoc");
        let role = map.create_role(assoc, rt, a).expect("role");

        MergeEngine::merge_topics(&mut map, a, b).expect("merge");
        assert!(map.topic(instance).expect("t").types.contains(&b));
        assert_eq!(map.occurrence(occ).expect("occ").typ, Some(b));
        assert!(map.themes(map.name(name).expect("n").scope).contains(&b));
        assert_eq!(map.role(role).expect("role").player, b);
        assert!(map.topic(b).expect("b").roles_played.contains(&role));
    }

    #[test]
    fn merge_folds_duplicate_occurrences_keeping_identifiers() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        let typ = map.create_topic();
        let oa = map
            .create_occurrence(a, Some(typ), "same", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        let ob = map
            .create_occurrence(b, Some(typ), "same", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        map.add_item_identifier(oa, loc("http://oa")).expect("ii");
        map.add_item_identifier(ob, loc("http://ob")).expect("ii");

        MergeEngine::merge_topics(&mut map, a, b).expect("merge");
        let data = map.topic(b).expect("b");
        assert_eq!(data.occurrences.len(), 1);
        let kept = *data.occurrences.iter().next().expect("occ");
        let iis = map.occurrence(kept).expect("occ").item_identifiers.clone();
        assert!(iis.contains(&loc("http://oa")));
        assert!(iis.contains(&loc("http://ob")));
    }

    #[test]
    fn merge_folds_duplicates_and_merges_their_reifiers() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        let na = map
            .create_name(a, None, "same", ScopeId::UNCONSTRAINED)
            .expect("name");
        let nb = map
            .create_name(b, None, "same", ScopeId::UNCONSTRAINED)
            .expect("name");
        let ra = map.create_topic();
        let rb = map.create_topic();
        map.add_subject_identifier(ra, loc("http://ra")).expect("si");
        map.add_subject_identifier(rb, loc("http://rb")).expect("si");
        map.set_reifier(na, Some(ra)).expect("reify");
        map.set_reifier(nb, Some(rb)).expect("reify");

        MergeEngine::merge_topics(&mut map, a, b).expect("merge");
        let data = map.topic(b).expect("b");
        assert_eq!(data.names.len(), 1);
        let kept = *data.names.iter().next().expect("name");
        let reifier = map.reifier_of(kept).expect("reifier").expect("some");
        // The two reifier topics are one now and carry both identifiers.
        let rd = map.topic(reifier).expect("topic");
        assert!(rd.subject_identifiers.contains(&loc("http://ra")));
        assert!(rd.subject_identifiers.contains(&loc("http://rb")));
    }

    #[test]
    fn merge_folds_associations_that_become_equal() {
        let mut map = TopicMap::new();
        let a = map.create_topic();
        let b = map.create_topic();
        let other = map.create_topic();
        let at = map.create_topic();
        let rt = map.create_topic();

        let a1 = map
            .create_association(Some(at), ScopeId::UNCONSTRAINED)
            .expect("assoc");
        map.create_role(a1, rt, a).expect("role");
        map.create_role(a1, rt, other).expect("role");
        let a2 = map
            .create_association(Some(at), ScopeId::UNCONSTRAINED)
            .expect("assoc");
        map.create_role(a2, rt, b).expect("role");
        map.create_role(a2, rt, other).expect("role");

        MergeEngine::merge_topics(&mut map, a, b).expect("merge");
        assert_eq!(map.association_count(), 1);
    }

    #[test]
    fn remove_duplicates_folds_names_and_variants() {
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let theme = map.create_topic();
        let scope = map.intern_scope(&[theme]).expect("scope");
        let n1 = map.create_name(t, None, "n", ScopeId::UNCONSTRAINED).expect("n");
        let n2 = map.create_name(t, None, "n", ScopeId::UNCONSTRAINED).expect("n");
        map.create_variant(n1, "v", None, scope).expect("variant");
        map.create_variant(n2, "v", None, scope).expect("variant");
        map.create_variant(n2, "w", None, scope).expect("variant");

        MergeEngine::remove_duplicates(&mut map, t).expect("dedup");
        let data = map.topic(t).expect("t");
        assert_eq!(data.names.len(), 1);
        let kept = *data.names.iter().next().expect("name");
        // "v" folded, "w" moved over.
        assert_eq!(map.name(kept).expect("name").variants.len(), 2);
    }

    #[test]
    fn merge_maps_matches_topics_by_identity() {
        let mut target = TopicMap::new();
        let t = target.create_topic();
        target
            .add_subject_identifier(t, loc("http://shared"))
            .expect("si");
        target
            .create_occurrence(t, None, "from-target", None, ScopeId::UNCONSTRAINED)
            .expect("occ");

        let mut source = TopicMap::new();
        let s = source.create_topic();
        source
            .add_subject_identifier(s, loc("http://shared"))
            .expect("si");
        source
            .create_occurrence(s, None, "from-source", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        let lone = source.create_topic();
        source
            .add_subject_identifier(lone, loc("http://lone"))
            .expect("si");

        let mapping = MergeEngine::merge_maps(&mut target, &source).expect("merge");
        assert_eq!(mapping.get(&s), Some(&t));
        assert_eq!(target.topic_count(), 2);
        assert_eq!(map_occurrence_count(&target, t), 2);
        assert!(target.topic_by_subject_identifier(&loc("http://lone")).is_some());
    }

    #[test]
    fn merge_maps_folds_identical_content() {
        let mut target = TopicMap::new();
        let mut source = TopicMap::new();
        for map in [&mut target, &mut source] {
            let t = map.create_topic();
            map.add_subject_identifier(t, loc("http://t")).expect("si");
            map.create_name(t, None, "n", ScopeId::UNCONSTRAINED).expect("name");
        }

        MergeEngine::merge_maps(&mut target, &source).expect("merge");
        assert_eq!(target.topic_count(), 1);
        let t = target
            .topic_by_subject_identifier(&loc("http://t"))
            .expect("topic");
        assert_eq!(target.topic(t).expect("t").names.len(), 1);
    }

    #[test]
    fn merge_maps_collapses_target_topics_claimed_by_one_source_topic() {
        let mut target = TopicMap::new();
        let t1 = target.create_topic();
        let t2 = target.create_topic();
        target.add_subject_identifier(t1, loc("http://x")).expect("si");
        target.add_subject_identifier(t2, loc("http://y")).expect("si");

        let mut source = TopicMap::new();
        let s = source.create_topic();
        source.add_subject_identifier(s, loc("http://x")).expect("si");
        source.add_subject_identifier(s, loc("http://y")).expect("si");

        MergeEngine::merge_maps(&mut target, &source).expect("merge");
        assert_eq!(target.topic_count(), 1);
        let survivor = target
            .topic_by_subject_identifier(&loc("http://x"))
            .expect("topic");
        assert_eq!(
            target.topic_by_subject_identifier(&loc("http://y")),
            Some(survivor)
        );
    }

    #[test]
    fn copy_reproduces_structure_with_fresh_handles() {
        let mut source = TopicMap::new();
        let t = source.create_topic();
        source.add_subject_identifier(t, loc("http://t")).expect("si");
        let typ = source.create_topic();
        source
            .add_subject_identifier(typ, loc("http://typ"))
            .expect("si");
        let rt = source.create_topic();
        source.add_subject_identifier(rt, loc("http://rt")).expect("si");
        let assoc = source
            .create_association(Some(typ), ScopeId::UNCONSTRAINED)
            .expect("assoc");
        source.create_role(assoc, rt, t).expect("role");
        source.create_name(t, None, "n", ScopeId::UNCONSTRAINED).expect("name");

        let copied = MergeEngine::copy(&source).expect("copy");
        assert_eq!(copied.topic_count(), source.topic_count());
        assert_eq!(copied.association_count(), 1);
        let ct = copied
            .topic_by_subject_identifier(&loc("http://t"))
            .expect("topic");
        assert_eq!(copied.topic(ct).expect("t").names.len(), 1);
        assert_eq!(copied.topic(ct).expect("t").roles_played.len(), 1);

        // Source untouched.
        assert!(source.contains(t));
    }

    #[test]
    fn reifier_cascade_dooming_the_target_still_merges() {
        // Folding t's occurrence into e's merges their reifiers, and that
        // inner merge dooms e while it is still the outer merge's target.
        let mut map = TopicMap::new();
        let t = map.create_topic();
        let e = map.create_topic();
        let r3 = map.create_topic();
        map.add_subject_identifier(e, loc("http://shared")).expect("si");
        let o1 = map
            .create_occurrence(t, None, "v", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        let o2 = map
            .create_occurrence(e, None, "v", None, ScopeId::UNCONSTRAINED)
            .expect("occ");
        map.set_reifier(o1, Some(e)).expect("reify");
        map.set_reifier(o2, Some(r3)).expect("reify");

        let survivor = map
            .add_subject_identifier(t, loc("http://shared"))
            .expect("merge");
        assert!(map.contains(survivor));
        assert_eq!(
            map.topic_by_subject_identifier(&loc("http://shared")),
            Some(survivor)
        );
        assert_eq!(map.topic_count(), 1);
        assert_eq!(map_occurrence_count(&map, survivor), 1);
    }

    fn map_occurrence_count(map: &TopicMap, topic: ConstructId) -> usize {
        map.topic(topic).map(|d| d.occurrences.len()).unwrap_or(0)
    }
}
