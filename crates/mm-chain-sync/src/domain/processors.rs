//! # Event Processors
//!
//! One pure function per on-chain process. Each maps
//! `(version, transaction, sender, inputs, outputs)` to a [`ChangeSet`].
//!
//! ## Contract
//!
//! - The version gate runs first; nothing is built for an unknown version.
//! - With a local [`Transaction`] the event was submitted by this instance:
//!   only `update` records are emitted, keyed by the transaction's
//!   `local_id` (comments by the transaction's own id).
//! - Without one the event was observed externally: new entities (and any
//!   backing attachment) are synthesised from roles and metadata under
//!   fresh ids.
//! - Inputs and outputs are positional. A count mismatch, a missing role or
//!   a missing metadata key fails the event.
//!
//! No I/O happens here; the event handler resolves everything beforehand.

use mm_types::{
    Address, CommentState, DemandState, DemandSubtype, Match2State, TokenContent, TokenId,
    Transaction,
};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::change_set::{
    AttachmentRecord, ChangeSet, DemandCommentRecord, DemandRecord, Match2CommentRecord,
    Match2Record,
};
use super::errors::SyncError;

/// The only process version this indexer understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// An input token together with the local entity it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInput {
    pub local_id: Uuid,
    pub token_id: TokenId,
}

/// Signature shared by every processor.
pub type EventProcessor = fn(
    u32,
    Option<&Transaction>,
    &str,
    &[ResolvedInput],
    &[TokenContent],
) -> Result<ChangeSet, SyncError>;

/// Known on-chain process names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessName {
    DemandCreate,
    DemandComment,
    Match2Propose,
    Match2Accept,
    Match2AcceptFinal,
    Match2Reject,
    Match2Cancel,
    Rematch2Propose,
    Rematch2AcceptFinal,
}

impl ProcessName {
    pub const ALL: [ProcessName; 9] = [
        ProcessName::DemandCreate,
        ProcessName::DemandComment,
        ProcessName::Match2Propose,
        ProcessName::Match2Accept,
        ProcessName::Match2AcceptFinal,
        ProcessName::Match2Reject,
        ProcessName::Match2Cancel,
        ProcessName::Rematch2Propose,
        ProcessName::Rematch2AcceptFinal,
    ];

    /// On-chain spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessName::DemandCreate => "demand_create",
            ProcessName::DemandComment => "demand_comment",
            ProcessName::Match2Propose => "match2_propose",
            ProcessName::Match2Accept => "match2_accept",
            ProcessName::Match2AcceptFinal => "match2_acceptFinal",
            ProcessName::Match2Reject => "match2_reject",
            ProcessName::Match2Cancel => "match2_cancel",
            ProcessName::Rematch2Propose => "rematch2_propose",
            ProcessName::Rematch2AcceptFinal => "rematch2_acceptFinal",
        }
    }

    /// The processor handling this process.
    pub fn processor(&self) -> EventProcessor {
        match self {
            ProcessName::DemandCreate => demand_create,
            ProcessName::DemandComment => demand_comment,
            ProcessName::Match2Propose => match2_propose,
            ProcessName::Match2Accept => match2_accept,
            ProcessName::Match2AcceptFinal => match2_accept_final,
            ProcessName::Match2Reject => match2_reject,
            ProcessName::Match2Cancel => match2_cancel,
            ProcessName::Rematch2Propose => rematch2_propose,
            ProcessName::Rematch2AcceptFinal => rematch2_accept_final,
        }
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| SyncError::UnknownProcess(s.to_string()))
    }
}

// =============================================================================
// PROCESSORS
// =============================================================================

/// `demand_create`: [] → [demand].
pub fn demand_create(
    version: u32,
    transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::DemandCreate;
    check_shape(process, version, inputs, 0, outputs, 1)?;
    let token = &outputs[0];

    if let Some(tx) = transaction {
        return Ok(ChangeSet::new().with_demand(DemandRecord {
            state: Some(DemandState::Created),
            latest_token_id: Some(token.id),
            original_token_id: Some(token.id),
            ..DemandRecord::update(tx.local_id)
        }));
    }

    let owner = role(token, "owner")?;
    let subtype: DemandSubtype = parse_metadata(token, "subtype")?;
    let attachment = new_attachment(metadata(token, "parameters")?, owner);

    Ok(ChangeSet::new()
        .with_demand(DemandRecord {
            owner: Some(owner.clone()),
            subtype: Some(subtype),
            state: Some(DemandState::Created),
            parameters_attachment_id: Some(attachment.id),
            latest_token_id: Some(token.id),
            original_token_id: Some(token.id),
            ..DemandRecord::insert(Uuid::new_v4())
        })
        .with_attachment(attachment))
}

/// `demand_comment`: [demand] → [demand].
pub fn demand_comment(
    version: u32,
    transaction: Option<&Transaction>,
    sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::DemandComment;
    check_shape(process, version, inputs, 1, outputs, 1)?;
    let demand_id = inputs[0].local_id;
    let token = &outputs[0];

    let change_set = ChangeSet::new().with_demand(advance(demand_id, token.id));

    if let Some(tx) = transaction {
        return Ok(change_set.with_demand_comment(DemandCommentRecord {
            state: Some(CommentState::Created),
            transaction_id: Some(tx.id),
            ..DemandCommentRecord::update(tx.id)
        }));
    }

    let attachment = new_attachment(metadata(token, "comment")?, &sender.to_string());
    Ok(change_set
        .with_demand_comment(DemandCommentRecord {
            owner: Some(sender.to_string()),
            state: Some(CommentState::Created),
            demand: Some(demand_id),
            attachment_id: Some(attachment.id),
            ..DemandCommentRecord::insert(Uuid::new_v4())
        })
        .with_attachment(attachment))
}

/// `match2_propose`: [demandA, demandB] → [demandA, demandB, match2].
pub fn match2_propose(
    version: u32,
    transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Match2Propose;
    check_shape(process, version, inputs, 2, outputs, 3)?;
    let (demand_a, demand_b) = (inputs[0].local_id, inputs[1].local_id);
    let match_token = &outputs[2];

    let change_set = ChangeSet::new()
        .with_demand(advance(demand_a, outputs[0].id))
        .with_demand(advance(demand_b, outputs[1].id));

    let record = match transaction {
        Some(tx) => Match2Record {
            state: Some(Match2State::Proposed),
            latest_token_id: Some(match_token.id),
            original_token_id: Some(match_token.id),
            ..Match2Record::update(tx.local_id)
        },
        None => Match2Record {
            demand_a_id: Some(demand_a),
            demand_b_id: Some(demand_b),
            ..new_match(match_token, Match2State::Proposed)?
        },
    };

    Ok(change_set.with_match2(record))
}

/// `match2_accept`: [match2] → [match2]. The new state comes from metadata.
pub fn match2_accept(
    version: u32,
    _transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Match2Accept;
    check_shape(process, version, inputs, 1, outputs, 1)?;
    let token = &outputs[0];

    let state: Match2State = parse_metadata(token, "state")?;
    if !matches!(state, Match2State::AcceptedA | Match2State::AcceptedB) {
        return Err(SyncError::InvalidMetadata {
            key: "state",
            token_id: token.id,
            value: state.to_string(),
        });
    }

    Ok(ChangeSet::new().with_match2(Match2Record {
        state: Some(state),
        latest_token_id: Some(token.id),
        ..Match2Record::update(inputs[0].local_id)
    }))
}

/// `match2_acceptFinal`: [demandA, demandB, match2] → same.
pub fn match2_accept_final(
    version: u32,
    _transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Match2AcceptFinal;
    check_shape(process, version, inputs, 3, outputs, 3)?;

    Ok(ChangeSet::new()
        .with_demand(demand_state(inputs[0].local_id, DemandState::Allocated, outputs[0].id))
        .with_demand(demand_state(inputs[1].local_id, DemandState::Allocated, outputs[1].id))
        .with_match2(match_state(
            inputs[2].local_id,
            Match2State::AcceptedFinal,
            outputs[2].id,
        )))
}

/// `match2_reject`: [match2] → []. The token is burnt without successor.
pub fn match2_reject(
    version: u32,
    _transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Match2Reject;
    check_shape(process, version, inputs, 1, outputs, 0)?;

    Ok(ChangeSet::new().with_match2(Match2Record {
        state: Some(Match2State::Rejected),
        ..Match2Record::update(inputs[0].local_id)
    }))
}

/// `match2_cancel`: [demandA, demandB, match2] → same, plus a comment.
pub fn match2_cancel(
    version: u32,
    transaction: Option<&Transaction>,
    sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Match2Cancel;
    check_shape(process, version, inputs, 3, outputs, 3)?;
    let match_id = inputs[2].local_id;

    let change_set = ChangeSet::new()
        .with_demand(demand_state(inputs[0].local_id, DemandState::Cancelled, outputs[0].id))
        .with_demand(demand_state(inputs[1].local_id, DemandState::Cancelled, outputs[1].id))
        .with_match2(match_state(match_id, Match2State::Cancelled, outputs[2].id));

    if let Some(tx) = transaction {
        return Ok(change_set.with_match2_comment(Match2CommentRecord {
            state: Some(CommentState::Created),
            transaction_id: Some(tx.id),
            ..Match2CommentRecord::update(tx.id)
        }));
    }

    let attachment = new_attachment(metadata(&outputs[2], "comment")?, &sender.to_string());
    Ok(change_set
        .with_match2_comment(Match2CommentRecord {
            owner: Some(sender.to_string()),
            state: Some(CommentState::Created),
            match2: Some(match_id),
            attachment_id: Some(attachment.id),
            ..Match2CommentRecord::insert(Uuid::new_v4())
        })
        .with_attachment(attachment))
}

/// `rematch2_propose`: [demandA, oldMatch2, newDemandB] →
/// [demandA, oldMatch2, newDemandB, newMatch2].
pub fn rematch2_propose(
    version: u32,
    transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Rematch2Propose;
    check_shape(process, version, inputs, 3, outputs, 4)?;
    let (demand_a, old_match, new_demand_b) =
        (inputs[0].local_id, inputs[1].local_id, inputs[2].local_id);
    let match_token = &outputs[3];

    let change_set = ChangeSet::new()
        .with_demand(advance(demand_a, outputs[0].id))
        .with_match2(Match2Record {
            latest_token_id: Some(outputs[1].id),
            ..Match2Record::update(old_match)
        })
        .with_demand(advance(new_demand_b, outputs[2].id));

    let record = match transaction {
        Some(tx) => Match2Record {
            state: Some(Match2State::Proposed),
            latest_token_id: Some(match_token.id),
            original_token_id: Some(match_token.id),
            ..Match2Record::update(tx.local_id)
        },
        None => Match2Record {
            demand_a_id: Some(demand_a),
            demand_b_id: Some(new_demand_b),
            replaces_id: Some(old_match),
            ..new_match(match_token, Match2State::Proposed)?
        },
    };

    Ok(change_set.with_match2(record))
}

/// `rematch2_acceptFinal`: [demandA, oldDemandB, oldMatch2, newDemandB,
/// newMatch2] → same.
pub fn rematch2_accept_final(
    version: u32,
    _transaction: Option<&Transaction>,
    _sender: &str,
    inputs: &[ResolvedInput],
    outputs: &[TokenContent],
) -> Result<ChangeSet, SyncError> {
    let process = ProcessName::Rematch2AcceptFinal;
    check_shape(process, version, inputs, 5, outputs, 5)?;

    Ok(ChangeSet::new()
        .with_demand(demand_state(inputs[0].local_id, DemandState::Allocated, outputs[0].id))
        .with_demand(demand_state(inputs[1].local_id, DemandState::Cancelled, outputs[1].id))
        .with_match2(match_state(
            inputs[2].local_id,
            Match2State::Cancelled,
            outputs[2].id,
        ))
        .with_demand(demand_state(inputs[3].local_id, DemandState::Allocated, outputs[3].id))
        .with_match2(match_state(
            inputs[4].local_id,
            Match2State::AcceptedFinal,
            outputs[4].id,
        )))
}

// =============================================================================
// HELPERS
// =============================================================================

fn check_shape(
    process: ProcessName,
    version: u32,
    inputs: &[ResolvedInput],
    expected_inputs: usize,
    outputs: &[TokenContent],
    expected_outputs: usize,
) -> Result<(), SyncError> {
    if version != SUPPORTED_VERSION {
        return Err(SyncError::UnsupportedVersion {
            process: process.as_str().to_string(),
            version,
        });
    }
    if inputs.len() != expected_inputs {
        return Err(SyncError::UnexpectedTokenCount {
            process: process.as_str(),
            side: "inputs",
            expected: expected_inputs,
            got: inputs.len(),
        });
    }
    if outputs.len() != expected_outputs {
        return Err(SyncError::UnexpectedTokenCount {
            process: process.as_str(),
            side: "outputs",
            expected: expected_outputs,
            got: outputs.len(),
        });
    }
    Ok(())
}

fn role<'a>(token: &'a TokenContent, role: &'static str) -> Result<&'a Address, SyncError> {
    token.roles.get(role).ok_or(SyncError::MissingRole {
        role,
        token_id: token.id,
    })
}

fn metadata<'a>(token: &'a TokenContent, key: &'static str) -> Result<&'a str, SyncError> {
    token
        .metadata
        .get(key)
        .map(String::as_str)
        .ok_or(SyncError::MissingMetadata {
            key,
            token_id: token.id,
        })
}

fn parse_metadata<T: FromStr>(token: &TokenContent, key: &'static str) -> Result<T, SyncError> {
    let value = metadata(token, key)?;
    value.parse().map_err(|_| SyncError::InvalidMetadata {
        key,
        token_id: token.id,
        value: value.to_string(),
    })
}

fn new_attachment(integrity_hash: &str, owner: &Address) -> AttachmentRecord {
    AttachmentRecord {
        integrity_hash: Some(integrity_hash.to_string()),
        owner_address: Some(owner.clone()),
        ..AttachmentRecord::insert(Uuid::new_v4())
    }
}

/// A match seen for the first time, built from the token's roles.
fn new_match(token: &TokenContent, state: Match2State) -> Result<Match2Record, SyncError> {
    Ok(Match2Record {
        optimiser: Some(role(token, "optimiser")?.clone()),
        member_a: Some(role(token, "member_a")?.clone()),
        member_b: Some(role(token, "member_b")?.clone()),
        state: Some(state),
        latest_token_id: Some(token.id),
        original_token_id: Some(token.id),
        ..Match2Record::insert(Uuid::new_v4())
    })
}

fn advance(demand_id: Uuid, token_id: TokenId) -> DemandRecord {
    DemandRecord {
        latest_token_id: Some(token_id),
        ..DemandRecord::update(demand_id)
    }
}

fn demand_state(demand_id: Uuid, state: DemandState, token_id: TokenId) -> DemandRecord {
    DemandRecord {
        state: Some(state),
        latest_token_id: Some(token_id),
        ..DemandRecord::update(demand_id)
    }
}

fn match_state(match_id: Uuid, state: Match2State, token_id: TokenId) -> Match2Record {
    Match2Record {
        state: Some(state),
        latest_token_id: Some(token_id),
        ..Match2Record::update(match_id)
    }
}
