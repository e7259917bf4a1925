//! # ChangeSet
//!
//! An in-memory, mergeable batch of pending entity mutations derived from
//! chain events. One `ChangeSet` is built per block and committed to the
//! store atomically.
//!
//! ## Merge Law
//!
//! `base.merge(update)` merges per entity kind and per id:
//!
//! - an id present on one side only is taken as is;
//! - an id present on both sides is shallow-merged field by field, the
//!   update's values winning, and its op is `Insert` if either side was.
//!
//! The law is associative and right-biased; it is commutative only when the
//! two sides touch disjoint ids. A kind absent from both sides stays absent
//! (`None`), so the committer can skip it without inspecting an empty map.

use mm_types::{
    Address, CommentState, DemandState, DemandSubtype, Match2State, TokenId,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Whether a record creates a new row or patches an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Update,
}

impl ChangeOp {
    /// `Insert` dominates: an update to a row inserted earlier in the same
    /// block is still an insert.
    pub fn merge(self, later: ChangeOp) -> ChangeOp {
        match (self, later) {
            (ChangeOp::Update, ChangeOp::Update) => ChangeOp::Update,
            _ => ChangeOp::Insert,
        }
    }
}

/// A record that can be folded with a later record for the same id.
pub trait ChangeRecord: Clone {
    fn merge(self, later: Self) -> Self;
}

/// Declares a patch record: an op tag, the map key and optional fields.
macro_rules! change_record {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub op: ChangeOp,
            pub id: Uuid,
            $( $(#[$fmeta])* pub $field: Option<$ty>, )+
        }

        impl $name {
            /// An empty record that will create row `id`.
            pub fn insert(id: Uuid) -> Self {
                Self {
                    op: ChangeOp::Insert,
                    id,
                    $( $field: None, )+
                }
            }

            /// An empty record that will patch row `id`.
            pub fn update(id: Uuid) -> Self {
                Self {
                    op: ChangeOp::Update,
                    id,
                    $( $field: None, )+
                }
            }
        }

        impl ChangeRecord for $name {
            fn merge(self, later: Self) -> Self {
                Self {
                    op: self.op.merge(later.op),
                    id: later.id,
                    $( $field: later.$field.or(self.$field), )+
                }
            }
        }
    };
}

change_record! {
    /// A new attachment referenced from chain metadata. `id` is provisional:
    /// the store assigns the real id at commit.
    AttachmentRecord {
        integrity_hash: String,
        owner_address: Address,
    }
}

change_record! {
    DemandRecord {
        owner: Address,
        subtype: DemandSubtype,
        state: DemandState,
        /// May be a provisional attachment id from the same change set.
        parameters_attachment_id: Uuid,
        latest_token_id: TokenId,
        original_token_id: TokenId,
    }
}

change_record! {
    Match2Record {
        optimiser: Address,
        member_a: Address,
        member_b: Address,
        state: Match2State,
        demand_a_id: Uuid,
        demand_b_id: Uuid,
        replaces_id: Uuid,
        latest_token_id: TokenId,
        original_token_id: TokenId,
    }
}

change_record! {
    /// Update records are keyed by the carrying transaction's id.
    DemandCommentRecord {
        owner: Address,
        state: CommentState,
        demand: Uuid,
        attachment_id: Uuid,
        transaction_id: Uuid,
    }
}

change_record! {
    /// Update records are keyed by the carrying transaction's id.
    Match2CommentRecord {
        owner: Address,
        state: CommentState,
        match2: Uuid,
        attachment_id: Uuid,
        transaction_id: Uuid,
    }
}

/// Per-kind maps of pending mutations, keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub attachments: Option<BTreeMap<Uuid, AttachmentRecord>>,
    pub demands: Option<BTreeMap<Uuid, DemandRecord>>,
    pub matches: Option<BTreeMap<Uuid, Match2Record>>,
    pub demand_comments: Option<BTreeMap<Uuid, DemandCommentRecord>>,
    pub match2_comments: Option<BTreeMap<Uuid, Match2CommentRecord>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attachment(mut self, record: AttachmentRecord) -> Self {
        upsert(&mut self.attachments, record.id, record);
        self
    }

    pub fn with_demand(mut self, record: DemandRecord) -> Self {
        upsert(&mut self.demands, record.id, record);
        self
    }

    pub fn with_match2(mut self, record: Match2Record) -> Self {
        upsert(&mut self.matches, record.id, record);
        self
    }

    pub fn with_demand_comment(mut self, record: DemandCommentRecord) -> Self {
        upsert(&mut self.demand_comments, record.id, record);
        self
    }

    pub fn with_match2_comment(mut self, record: Match2CommentRecord) -> Self {
        upsert(&mut self.match2_comments, record.id, record);
        self
    }

    /// Fold `update` on top of `self`. See the module docs for the law.
    pub fn merge(self, update: ChangeSet) -> ChangeSet {
        ChangeSet {
            attachments: merge_maps(self.attachments, update.attachments),
            demands: merge_maps(self.demands, update.demands),
            matches: merge_maps(self.matches, update.matches),
            demand_comments: merge_maps(self.demand_comments, update.demand_comments),
            match2_comments: merge_maps(self.match2_comments, update.match2_comments),
        }
    }

    /// True when no kind carries a map at all.
    pub fn is_empty(&self) -> bool {
        self.attachments.is_none()
            && self.demands.is_none()
            && self.matches.is_none()
            && self.demand_comments.is_none()
            && self.match2_comments.is_none()
    }

    /// Local id of the demand or match whose latest token is `token_id`.
    ///
    /// Covers chains of events inside one block, where a later event burns a
    /// token minted by an earlier one that is not yet in the store.
    pub fn find_local_id(&self, token_id: TokenId) -> Option<Uuid> {
        let demand = self.demands.iter().flat_map(|m| m.values()).find_map(|r| {
            (r.latest_token_id == Some(token_id)).then_some(r.id)
        });
        demand.or_else(|| {
            self.matches.iter().flat_map(|m| m.values()).find_map(|r| {
                (r.latest_token_id == Some(token_id)).then_some(r.id)
            })
        })
    }

    /// Number of records across all kinds.
    pub fn len(&self) -> usize {
        fn count<R>(map: &Option<BTreeMap<Uuid, R>>) -> usize {
            map.as_ref().map_or(0, BTreeMap::len)
        }
        count(&self.attachments)
            + count(&self.demands)
            + count(&self.matches)
            + count(&self.demand_comments)
            + count(&self.match2_comments)
    }
}

fn upsert<R: ChangeRecord>(map: &mut Option<BTreeMap<Uuid, R>>, id: Uuid, record: R) {
    upsert_into(map.get_or_insert_with(BTreeMap::new), id, record);
}

fn merge_maps<R: ChangeRecord>(
    base: Option<BTreeMap<Uuid, R>>,
    update: Option<BTreeMap<Uuid, R>>,
) -> Option<BTreeMap<Uuid, R>> {
    match (base, update) {
        (None, None) => None,
        (Some(base), None) => Some(base),
        (None, Some(update)) => Some(update),
        (Some(mut base), Some(update)) => {
            for (id, record) in update {
                upsert_into(&mut base, id, record);
            }
            Some(base)
        }
    }
}

fn upsert_into<R: ChangeRecord>(map: &mut BTreeMap<Uuid, R>, id: Uuid, record: R) {
    let merged = match map.remove(&id) {
        Some(existing) => existing.merge(record),
        None => record,
    };
    map.insert(id, merged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn test_absent_kinds_stay_absent() {
        let merged = ChangeSet::new().merge(ChangeSet::new());
        assert!(merged.is_empty());
        assert_eq!(merged.demands, None);
    }

    #[test]
    fn test_one_sided_kind_is_kept() {
        let base = ChangeSet::new().with_demand(DemandRecord::update(id(1)));
        let merged = base.clone().merge(ChangeSet::new());
        assert_eq!(merged, base);
        assert_eq!(merged.matches, None);
    }

    #[test]
    fn test_update_fields_win() {
        let base = ChangeSet::new().with_demand(DemandRecord {
            state: Some(DemandState::Created),
            latest_token_id: Some(1),
            original_token_id: Some(1),
            ..DemandRecord::insert(id(1))
        });
        let update = ChangeSet::new().with_demand(DemandRecord {
            state: Some(DemandState::Allocated),
            latest_token_id: Some(5),
            ..DemandRecord::update(id(1))
        });

        let merged = base.merge(update);
        let record = &merged.demands.unwrap()[&id(1)];
        assert_eq!(record.op, ChangeOp::Insert);
        assert_eq!(record.state, Some(DemandState::Allocated));
        assert_eq!(record.latest_token_id, Some(5));
        assert_eq!(record.original_token_id, Some(1));
    }

    #[test]
    fn test_insert_promotes_update() {
        let base = ChangeSet::new().with_match2(Match2Record::update(id(2)));
        let update = ChangeSet::new().with_match2(Match2Record::insert(id(2)));
        let merged = base.merge(update);
        assert_eq!(merged.matches.unwrap()[&id(2)].op, ChangeOp::Insert);
    }

    #[test]
    fn test_find_local_id_prefers_latest_token() {
        let change_set = ChangeSet::new()
            .with_demand(DemandRecord {
                latest_token_id: Some(10),
                ..DemandRecord::update(id(1))
            })
            .with_match2(Match2Record {
                latest_token_id: Some(11),
                ..Match2Record::insert(id(2))
            });

        assert_eq!(change_set.find_local_id(10), Some(id(1)));
        assert_eq!(change_set.find_local_id(11), Some(id(2)));
        assert_eq!(change_set.find_local_id(12), None);
    }

    #[test]
    fn test_len_counts_all_kinds() {
        let change_set = ChangeSet::new()
            .with_attachment(AttachmentRecord::insert(id(1)))
            .with_demand(DemandRecord::insert(id(2)))
            .with_demand(DemandRecord::update(id(2)))
            .with_match2_comment(Match2CommentRecord::update(id(3)));
        assert_eq!(change_set.len(), 3);
    }

    // =========================================================================
    // PROPERTY TESTS
    // =========================================================================

    fn demand_record() -> impl Strategy<Value = DemandRecord> {
        (
            0u8..4,
            any::<bool>(),
            proptest::option::of(0usize..4),
            proptest::option::of(0u64..100),
        )
            .prop_map(|(n, insert, state, token)| {
                let states = [
                    DemandState::Pending,
                    DemandState::Created,
                    DemandState::Allocated,
                    DemandState::Cancelled,
                ];
                let base = if insert {
                    DemandRecord::insert(id(n))
                } else {
                    DemandRecord::update(id(n))
                };
                DemandRecord {
                    state: state.map(|i| states[i]),
                    latest_token_id: token,
                    ..base
                }
            })
    }

    fn change_set() -> impl Strategy<Value = ChangeSet> {
        proptest::collection::vec(demand_record(), 0..4).prop_map(|records| {
            records
                .into_iter()
                .fold(ChangeSet::new(), ChangeSet::with_demand)
        })
    }

    proptest! {
        #[test]
        fn prop_merge_is_associative(a in change_set(), b in change_set(), c in change_set()) {
            let left = a.clone().merge(b.clone()).merge(c.clone());
            let right = a.merge(b.merge(c));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_later_fields_win(a in change_set(), b in change_set()) {
            let merged = a.clone().merge(b.clone());
            if let Some(updates) = &b.demands {
                let merged_demands = merged.demands.as_ref().unwrap();
                for (key, later) in updates {
                    let result = &merged_demands[key];
                    if later.state.is_some() {
                        prop_assert_eq!(result.state, later.state);
                    }
                    if later.latest_token_id.is_some() {
                        prop_assert_eq!(result.latest_token_id, later.latest_token_id);
                    }
                }
            }
        }

        #[test]
        fn prop_disjoint_merge_commutes(a in change_set()) {
            // Shift every id out of `a`'s range to make the sides disjoint.
            let shifted = ChangeSet {
                demands: a.demands.as_ref().map(|m| {
                    m.values()
                        .map(|r| {
                            let moved = Uuid::from_bytes([r.id.as_bytes()[0] + 100; 16]);
                            (moved, DemandRecord { id: moved, ..r.clone() })
                        })
                        .collect()
                }),
                ..ChangeSet::default()
            };
            let ab = a.clone().merge(shifted.clone());
            let ba = shifted.merge(a);
            prop_assert_eq!(ab, ba);
        }
    }
}
