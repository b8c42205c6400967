//! Query planning and lazy match iteration.
//!
//! The planner picks one index path to produce candidates; every candidate is
//! then checked against the full template, so the chosen path only has to
//! produce a superset of the answer.

use lodestar_types::{Entry, ServiceId, ServiceItem, ServiceTemplate};
use rand::Rng;
use std::collections::HashSet;

use crate::index::{AttrKey, ServiceIndex, ServiceReg};

/// Chosen candidate source for a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The template names a service id
    ById(ServiceId),
    /// Smallest bucket among the required type names
    ByType(String),
    /// Most specific non-null field across the entry templates
    ByAttr { key: AttrKey, template: usize },
    /// A wildcard template whose class is the only live one and has no fields
    EmptyClass(u64),
    /// Every live class assignable to a wildcard template; may yield duplicates
    HierarchyScan(usize),
    /// No live instance can satisfy the template
    Empty,
    FullScan,
}

pub(crate) fn plan(index: &ServiceIndex, template: &ServiceTemplate) -> Plan {
    if let Some(id) = template.service_id {
        return Plan::ById(id);
    }

    if let Some(ty) = template
        .service_types
        .iter()
        .min_by_key(|t| index.type_bucket(t.name()).len())
    {
        return Plan::ByType(ty.name().to_string());
    }

    let mut best: Option<(usize, usize)> = None;
    for (i, tmpl) in template.attribute_templates.iter().enumerate() {
        if let Some(k) = tmpl.fields().iter().rposition(|f| f.is_some()) {
            if best.map_or(true, |(_, bk)| k > bk) {
                best = Some((i, k));
            }
        }
    }
    if let Some((i, k)) = best {
        let class = template.attribute_templates[i].class();
        return Plan::ByAttr {
            key: (class.defining_class(k).content_hash(), k),
            template: i,
        };
    }

    let cheapest = template
        .attribute_templates
        .iter()
        .enumerate()
        .map(|(i, tmpl)| (i, live_instances(index, tmpl)))
        .min_by_key(|(_, n)| *n);
    if let Some((i, n)) = cheapest {
        if n == 0 {
            return Plan::Empty;
        }
        let class = template.attribute_templates[i].class();
        let mut live = index
            .live_classes()
            .filter(|(c, _)| class.is_assignable_from(c));
        if let (Some((only, _)), None) = (live.next(), live.next()) {
            if only.content_hash() == class.content_hash() && only.field_count() == 0 {
                return Plan::EmptyClass(only.content_hash());
            }
        }
        return Plan::HierarchyScan(i);
    }

    Plan::FullScan
}

fn live_instances(index: &ServiceIndex, tmpl: &Entry) -> usize {
    index
        .live_classes()
        .filter(|(c, _)| tmpl.class().is_assignable_from(c))
        .map(|(_, n)| n)
        .sum()
}

/// Lazily yields live registrations matching a template.
///
/// Borrowing the index for its whole life, the iterator observes one
/// consistent state when created under the reader role.
pub struct MatchIter<'a> {
    index: &'a ServiceIndex,
    template: &'a ServiceTemplate,
    now: i64,
    candidates: Box<dyn Iterator<Item = ServiceId> + 'a>,
    seen: Option<HashSet<ServiceId>>,
}

impl<'a> MatchIter<'a> {
    pub(crate) fn new(index: &'a ServiceIndex, template: &'a ServiceTemplate, now: i64) -> Self {
        let plan = plan(index, template);
        let dedup = matches!(plan, Plan::HierarchyScan(_));
        let candidates: Box<dyn Iterator<Item = ServiceId> + 'a> = match plan {
            Plan::ById(id) => Box::new(std::iter::once(id)),
            Plan::ByType(name) => Box::new(index.type_bucket(&name).iter().copied()),
            Plan::ByAttr { key, template: i } => {
                let k = key.1;
                match template.attribute_templates[i].fields()[k]
                    .as_ref()
                    .and_then(|v| index.attr_bucket(key, v))
                {
                    Some(ids) => Box::new(ids.iter().copied()),
                    None => Box::new(std::iter::empty()),
                }
            }
            Plan::EmptyClass(hash) => match index.empty_attr_bucket(hash) {
                Some(ids) => Box::new(ids.iter().copied()),
                None => Box::new(std::iter::empty()),
            },
            Plan::HierarchyScan(i) => hierarchy_scan(index, &template.attribute_templates[i]),
            Plan::Empty => Box::new(std::iter::empty()),
            Plan::FullScan => Box::new(index.ids().copied()),
        };

        Self {
            index,
            template,
            now,
            candidates,
            seen: dedup.then(HashSet::new),
        }
    }
}

fn hierarchy_scan<'a>(
    index: &'a ServiceIndex,
    tmpl: &'a Entry,
) -> Box<dyn Iterator<Item = ServiceId> + 'a> {
    let class = tmpl.class();
    Box::new(
        index
            .live_classes()
            .filter(move |(c, _)| class.is_assignable_from(c))
            .flat_map(move |(c, _)| -> Box<dyn Iterator<Item = ServiceId> + 'a> {
                let n = c.field_count();
                if n == 0 {
                    return match index.empty_attr_bucket(c.content_hash()) {
                        Some(ids) => Box::new(ids.iter().copied()),
                        None => Box::new(std::iter::empty()),
                    };
                }
                let key = (c.defining_class(n - 1).content_hash(), n - 1);
                match index.attr_buckets(key) {
                    Some(values) => Box::new(values.values().flat_map(|ids| ids.iter().copied())),
                    None => Box::new(std::iter::empty()),
                }
            }),
    )
}

impl<'a> Iterator for MatchIter<'a> {
    type Item = &'a ServiceReg;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.candidates.by_ref() {
            if let Some(seen) = self.seen.as_mut() {
                if !seen.insert(id) {
                    continue;
                }
            }
            let Some(reg) = self.index.get(&id) else {
                continue;
            };
            if reg.expiration <= self.now {
                continue;
            }
            if self.template.matches(&reg.item) {
                return Some(reg);
            }
        }
        None
    }
}

/// Bounded lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matches {
    /// Defensive copies of at most `max_matches` items
    pub items: Vec<ServiceItem>,
    /// Number of live matches, which may exceed `items.len()`
    pub total_matches: usize,
}

/// One matching item, chosen at random when only types were constrained.
pub(crate) fn lookup_one<'a>(
    index: &'a ServiceIndex,
    template: &'a ServiceTemplate,
    now: i64,
) -> Option<&'a ServiceReg> {
    let mut iter = MatchIter::new(index, template, now);
    if !template.is_type_only() {
        return iter.next();
    }
    let all: Vec<&ServiceReg> = iter.collect();
    match all.len() {
        0 => None,
        1 => Some(all[0]),
        n => Some(all[rand::thread_rng().gen_range(0..n)]),
    }
}

pub(crate) fn lookup_matches(
    index: &ServiceIndex,
    template: &ServiceTemplate,
    max_matches: usize,
    now: i64,
) -> Matches {
    let mut items = Vec::new();
    let mut total_matches = 0;
    for reg in MatchIter::new(index, template, now) {
        if items.len() < max_matches {
            items.push(reg.item.clone());
        }
        total_matches += 1;
    }
    Matches {
        items,
        total_matches,
    }
}
