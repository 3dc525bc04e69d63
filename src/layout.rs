use crate::time::{hhmm, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const WEEKDAYS: u8 = 7;

/// One recurring class session as the layout engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub weekday: u8,
    pub range: TimeRange,
    pub enrollment_ids: Vec<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, weekday: u8, range: TimeRange) -> Self {
        Self {
            id: id.into(),
            weekday,
            range,
            enrollment_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutConfig {
    pub slot_height_px: u32,
    /// Padding reserved once per non-empty day, not per row.
    pub slot_margin_px: u32,
    pub min_day_height_px: u32,
    #[serde(with = "hhmm")]
    pub day_start: u32,
    #[serde(with = "hhmm")]
    pub day_end: u32,
    pub hour_width_px: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            slot_height_px: 48,
            slot_margin_px: 12,
            min_day_height_px: 60,
            day_start: 7 * 60,
            day_end: 22 * 60,
            hour_width_px: 120,
        }
    }
}

impl LayoutConfig {
    /// Full width of the visible day, `day_start..day_end`.
    pub fn grid_width(&self) -> f64 {
        let minutes = self.day_end.saturating_sub(self.day_start);
        f64::from(minutes) / 60.0 * f64::from(self.hour_width_px)
    }
}

/// Half-open interval intersection: sessions that only touch do not overlap.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.start() < b.end() && b.start() < a.end()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub session_id: String,
    pub slot: usize,
}

/// Slot per session, kept in the order the sessions were placed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotAssignment {
    placements: Vec<Placement>,
    by_id: HashMap<String, usize>,
}

impl SlotAssignment {
    fn push(&mut self, session_id: &str, slot: usize) {
        self.by_id.insert(session_id.to_string(), slot);
        self.placements.push(Placement {
            session_id: session_id.to_string(),
            slot,
        });
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn slot_of(&self, session_id: &str) -> Option<usize> {
        self.by_id.get(session_id).copied()
    }

    pub fn max_slot(&self) -> Option<usize> {
        self.placements().iter().map(|p| p.slot).max()
    }

    pub fn required_slots(&self) -> usize {
        self.max_slot().map(|m| m + 1).unwrap_or(0)
    }
}

/// Greedy row assignment for the sessions of one weekday.
///
/// Sessions are visited by ascending start time (stable, so equal starts keep
/// input order). Each one lands directly below the highest slot used by an
/// already-placed session it overlaps, or in slot 0 if it overlaps none.
///
/// Session ids are expected to be unique. `TimeRange` already rules out empty ranges.
pub fn assign_slots(sessions: &[Session]) -> SlotAssignment {
    let mut order: Vec<&Session> = sessions.iter().collect();
    order.sort_by_key(|s| s.range.start());

    let mut assignment = SlotAssignment::default();
    for (i, current) in order.iter().enumerate() {
        let slot = order[..i]
            .iter()
            .zip(assignment.placements.iter())
            .filter(|(earlier, _)| overlaps(&earlier.range, &current.range))
            .map(|(_, placed)| placed.slot + 1)
            .max()
            .unwrap_or(0);
        assignment.push(&current.id, slot);
    }
    assignment
}

pub fn day_height(assignment: &SlotAssignment, config: &LayoutConfig) -> u32 {
    let Some(max_slot) = assignment.max_slot() else {
        return config.min_day_height_px;
    };
    let rows = u32::try_from(max_slot + 1).unwrap_or(u32::MAX);
    let required = rows
        .saturating_mul(config.slot_height_px)
        .saturating_add(config.slot_margin_px);
    required.max(config.min_day_height_px)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlockGeometry {
    pub left: f64,
    pub width: f64,
}

/// Horizontal offset and width of a session block, relative to `day_start`.
pub fn block_geometry(range: &TimeRange, config: &LayoutConfig) -> BlockGeometry {
    let px_per_minute = f64::from(config.hour_width_px) / 60.0;
    let offset = i64::from(range.start()) - i64::from(config.day_start);
    BlockGeometry {
        left: offset as f64 * px_per_minute,
        width: f64::from(range.duration_minutes()) * px_per_minute,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub session_id: String,
    pub starts_at: String,
    pub ends_at: String,
    pub enrollment_ids: Vec<String>,
    pub slot: usize,
    pub top: u32,
    pub left: f64,
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayLayout {
    pub weekday: u8,
    pub required_slots: usize,
    pub pixel_height: u32,
    pub blocks: Vec<Block>,
}

/// Positions every session of `weekday`; sessions on other days are skipped.
/// Blocks come back in input order.
pub fn layout_day(weekday: u8, sessions: &[Session], config: &LayoutConfig) -> DayLayout {
    let day: Vec<Session> = sessions
        .iter()
        .filter(|s| s.weekday == weekday)
        .cloned()
        .collect();
    let assignment = assign_slots(&day);

    let blocks = day
        .iter()
        .filter_map(|session| {
            let slot = assignment.slot_of(&session.id)?;
            let geometry = block_geometry(&session.range, config);
            let slot_row = u32::try_from(slot).unwrap_or(u32::MAX);
            Some(Block {
                session_id: session.id.clone(),
                starts_at: session.range.starts_at(),
                ends_at: session.range.ends_at(),
                enrollment_ids: session.enrollment_ids.clone(),
                slot,
                top: slot_row.saturating_mul(config.slot_height_px),
                left: geometry.left,
                width: geometry.width,
            })
        })
        .collect();

    DayLayout {
        weekday,
        required_slots: assignment.required_slots(),
        pixel_height: day_height(&assignment, config),
        blocks,
    }
}

pub fn layout_week(sessions: &[Session], config: &LayoutConfig) -> Vec<DayLayout> {
    (0..WEEKDAYS)
        .map(|weekday| layout_day(weekday, sessions, config))
        .collect()
}

/// Every overlapping pair within one weekday, earlier-starting session first.
pub fn overlapping_pairs(sessions: &[Session]) -> Vec<(String, String)> {
    let mut order: Vec<&Session> = sessions.iter().collect();
    order.sort_by_key(|s| s.range.start());
    let mut pairs = Vec::new();
    for (i, a) in order.iter().enumerate() {
        for b in &order[i + 1..] {
            if a.weekday == b.weekday && overlaps(&a.range, &b.range) {
                pairs.push((a.id.clone(), b.id.clone()));
            }
        }
    }
    pairs
}
