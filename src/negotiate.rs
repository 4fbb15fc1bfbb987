// Padding Negotiation — lifecycle synchronization between circuit endpoints
//
// A small request/response protocol carried on the circuit's reliable
// in-order control channel. The initiator installs a unit optimistically
// and walks the peer through None → Created → Working ⇄ Paused → Cleared;
// the responder installs, removes, and arms units on command. Ordering
// relies entirely on the underlying channel — there is no reordering
// logic here. Malformed frames are logged and dropped; this subsystem
// never tears a circuit down.

use crate::config::ConfigRegistry;
use crate::executor::ProgramLoader;
use crate::runtime::{CircuitPaddingRuntime, PeerUnitState};
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts before a negotiation failure is declared persistent
pub const MAX_NEGOTIATION_RETRIES: u8 = 5;

/// Request frame size: command (1) + uuid (1) + counter (4)
pub const REQUEST_FRAME_LEN: usize = 6;

/// Response frame size: command (1) + uuid (1) + response (1) + counter (4)
pub const RESPONSE_FRAME_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("Bad negotiation frame length: need {need}, got {got}")]
    ShortFrame { need: usize, got: usize },
    #[error("Unknown negotiation command: {0:#04x}")]
    UnknownCommand(u8),
    #[error("Unknown response code: {0:#04x}")]
    UnknownResponse(u8),
    #[error("Unit {0} has no Created acknowledgement from the peer")]
    NotNegotiated(u8),
    #[error("Unit {0} not installed")]
    UnitNotFound(u8),
}

/// Negotiation command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NegotiationCommand {
    /// Install (or replace) a unit on the responder
    Start = 0x01,
    /// Remove a unit on the responder
    Stop = 0x02,
    /// Arm or disarm the responder's padding ticker
    State = 0x03,
    /// Reserved; acknowledged no-op
    Data = 0x04,
}

impl NegotiationCommand {
    pub fn from_u8(value: u8) -> Result<Self, NegotiateError> {
        match value {
            0x01 => Ok(NegotiationCommand::Start),
            0x02 => Ok(NegotiationCommand::Stop),
            0x03 => Ok(NegotiationCommand::State),
            0x04 => Ok(NegotiationCommand::Data),
            other => Err(NegotiateError::UnknownCommand(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Response code byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    Err = 0x01,
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Result<Self, NegotiateError> {
        match value {
            0x00 => Ok(ResponseCode::Ok),
            0x01 => Ok(ResponseCode::Err),
            other => Err(NegotiateError::UnknownResponse(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Negotiation request
///
/// Wire format (6 bytes): [1 command][1 uuid][4 counter LE].
/// The counter carries a version (START/STOP) or a target peer state
/// (STATE); it is zero for DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub command: NegotiationCommand,
    pub uuid: u8,
    pub counter: u32,
}

impl NegotiationRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_FRAME_LEN);
        buf.push(self.command.as_u8());
        buf.push(self.uuid);
        buf.extend_from_slice(&self.counter.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, NegotiateError> {
        if data.len() != REQUEST_FRAME_LEN {
            return Err(NegotiateError::ShortFrame {
                need: REQUEST_FRAME_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            command: NegotiationCommand::from_u8(data[0])?,
            uuid: data[1],
            counter: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
        })
    }
}

/// Negotiation response
///
/// Wire format (7 bytes): [1 command][1 uuid][1 response][4 counter LE].
/// The counter echoes the responder's version (START), the removed
/// version (STOP), or the applied target state (STATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationResponse {
    pub command: NegotiationCommand,
    pub uuid: u8,
    pub response: ResponseCode,
    pub counter: u32,
}

impl NegotiationResponse {
    pub fn ok(command: NegotiationCommand, uuid: u8, counter: u32) -> Self {
        Self {
            command,
            uuid,
            response: ResponseCode::Ok,
            counter,
        }
    }

    pub fn err(command: NegotiationCommand, uuid: u8) -> Self {
        Self {
            command,
            uuid,
            response: ResponseCode::Err,
            counter: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_FRAME_LEN);
        buf.push(self.command.as_u8());
        buf.push(self.uuid);
        buf.push(self.response.as_u8());
        buf.extend_from_slice(&self.counter.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, NegotiateError> {
        if data.len() != RESPONSE_FRAME_LEN {
            return Err(NegotiateError::ShortFrame {
                need: RESPONSE_FRAME_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            command: NegotiationCommand::from_u8(data[0])?,
            uuid: data[1],
            response: ResponseCode::from_u8(data[2])?,
            counter: u32::from_le_bytes([data[3], data[4], data[5], data[6]]),
        })
    }
}

// ============================================================================
// INITIATOR SIDE
// ============================================================================

/// Build a START request, installing the unit optimistically
///
/// The local unit exists with peer_state None until the responder's OK
/// advances it to Created; an ERR frees it again.
pub fn start_request(
    runtime: &mut CircuitPaddingRuntime,
    registry: &ConfigRegistry,
    loader: &dyn ProgramLoader,
    uuid: u8,
    replace: bool,
) -> Option<NegotiationRequest> {
    let desc = match registry.lookup(uuid) {
        Some(d) => d,
        None => {
            debug!("{}: START skipped, uuid {} not configured", runtime.circuit(), uuid);
            return None;
        }
    };
    let program = match loader.load(desc.category, &desc.bytecode) {
        Ok(p) => p,
        Err(e) => {
            warn!("{}: program load failed for uuid {}: {}", runtime.circuit(), uuid, e);
            return None;
        }
    };
    let outcome = runtime.install(
        desc.uuid,
        desc.category,
        desc.target_hop,
        desc.tick_interval_ms,
        program,
        replace,
    );
    Some(NegotiationRequest {
        command: NegotiationCommand::Start,
        uuid,
        counter: outcome.version(),
    })
}

/// Build a STOP request, removing the unit locally first
///
/// Returns None when no such unit is installed (nothing to stop).
pub fn stop_request(runtime: &mut CircuitPaddingRuntime, uuid: u8) -> Option<NegotiationRequest> {
    let version = runtime.unit_by_uuid(uuid).map(|u| u.version)?;
    runtime.remove(uuid, version);
    Some(NegotiationRequest {
        command: NegotiationCommand::Stop,
        uuid,
        counter: version,
    })
}

/// Build a STATE request targeting the given peer state
///
/// Refused before the peer has acknowledged the install: a unit whose
/// peer_state is still None cannot be armed remotely.
pub fn state_request(
    runtime: &CircuitPaddingRuntime,
    uuid: u8,
    target: PeerUnitState,
) -> Result<NegotiationRequest, NegotiateError> {
    let unit = runtime
        .unit_by_uuid(uuid)
        .ok_or(NegotiateError::UnitNotFound(uuid))?;
    if unit.peer_state == PeerUnitState::None {
        return Err(NegotiateError::NotNegotiated(uuid));
    }
    Ok(NegotiationRequest {
        command: NegotiationCommand::State,
        uuid,
        counter: target.as_u8() as u32,
    })
}

/// Apply a peer's response to local state
///
/// peer_state advances only on an acknowledged response whose counter
/// matches the live unit version (START) or names a valid target state
/// (STATE). ERR on START frees the optimistic unit; ERR on STATE leaves
/// the cached state unchanged.
pub fn handle_response(runtime: &mut CircuitPaddingRuntime, resp: &NegotiationResponse) {
    match (resp.command, resp.response) {
        (NegotiationCommand::Start, ResponseCode::Ok) => {
            let circuit = runtime.circuit();
            if let Some(unit) = runtime.unit_by_uuid_mut(resp.uuid) {
                if unit.version != resp.counter {
                    warn!(
                        "{}: START ack for uuid {} names v{}, live unit is v{} — ignored",
                        circuit, resp.uuid, resp.counter, unit.version
                    );
                    return;
                }
                unit.peer_state = PeerUnitState::Created;
                unit.retry_count = 0;
                debug!("{}: unit {} acknowledged by peer (v{})", circuit, resp.uuid, resp.counter);
            }
        }
        (NegotiationCommand::Start, ResponseCode::Err) => {
            warn!("{}: peer rejected unit {}, freeing local unit", runtime.circuit(), resp.uuid);
            if let Some(version) = runtime.unit_by_uuid(resp.uuid).map(|u| u.version) {
                runtime.remove(resp.uuid, version);
            }
        }
        (NegotiationCommand::State, ResponseCode::Ok) => {
            let target = PeerUnitState::from_u8(resp.counter as u8);
            let circuit = runtime.circuit();
            if let (Some(unit), Some(target)) = (runtime.unit_by_uuid_mut(resp.uuid), target) {
                unit.peer_state = target;
                unit.retry_count = 0;
                debug!("{}: peer state for unit {} now {:?}", circuit, resp.uuid, target);
            }
        }
        (NegotiationCommand::State, ResponseCode::Err) => {
            debug!(
                "{}: peer refused state change for unit {} — cached state unchanged",
                runtime.circuit(),
                resp.uuid
            );
        }
        (NegotiationCommand::Stop, _) => {
            // Local unit already removed when the STOP was sent
            debug!("{}: STOP acknowledged for unit {}", runtime.circuit(), resp.uuid);
        }
        (NegotiationCommand::Data, _) => {}
    }
}

// ============================================================================
// RESPONDER SIDE
// ============================================================================

/// Handle one request from the peer
///
/// Returns the response to send, or None when the reply is suppressed
/// (STOP for a unit that was not found).
pub fn respond(
    runtime: &mut CircuitPaddingRuntime,
    registry: &ConfigRegistry,
    loader: &dyn ProgramLoader,
    req: &NegotiationRequest,
    now_ms: u64,
) -> Option<NegotiationResponse> {
    match req.command {
        NegotiationCommand::Start => {
            let desc = match registry.lookup(req.uuid) {
                Some(d) => d,
                None => {
                    debug!(
                        "{}: START for unconfigured uuid {} — ERR",
                        runtime.circuit(),
                        req.uuid
                    );
                    return Some(NegotiationResponse::err(NegotiationCommand::Start, req.uuid));
                }
            };
            let program = match loader.load(desc.category, &desc.bytecode) {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}: program load failed for uuid {}: {}", runtime.circuit(), req.uuid, e);
                    return Some(NegotiationResponse::err(NegotiationCommand::Start, req.uuid));
                }
            };
            let outcome = runtime.install(
                desc.uuid,
                desc.category,
                desc.target_hop,
                desc.tick_interval_ms,
                program,
                true,
            );
            Some(NegotiationResponse::ok(
                NegotiationCommand::Start,
                req.uuid,
                outcome.version(),
            ))
        }
        NegotiationCommand::Stop => {
            if runtime.remove(req.uuid, req.counter) {
                Some(NegotiationResponse::ok(
                    NegotiationCommand::Stop,
                    req.uuid,
                    req.counter,
                ))
            } else {
                // Reply suppressed: nothing was installed under this uuid
                debug!("{}: STOP for absent unit {} — no reply", runtime.circuit(), req.uuid);
                None
            }
        }
        NegotiationCommand::State => {
            let target = match PeerUnitState::from_u8(req.counter as u8) {
                Some(t) => t,
                None => {
                    warn!(
                        "{}: STATE with invalid target {} for unit {}",
                        runtime.circuit(),
                        req.counter,
                        req.uuid
                    );
                    return Some(NegotiationResponse::err(NegotiationCommand::State, req.uuid));
                }
            };
            if runtime.unit_by_uuid(req.uuid).is_none() {
                debug!(
                    "{}: STATE({:?}) for unknown unit {} — ERR",
                    runtime.circuit(),
                    target,
                    req.uuid
                );
                return Some(NegotiationResponse::err(NegotiationCommand::State, req.uuid));
            }
            match target {
                PeerUnitState::Working => {
                    runtime.activate_by_uuid(req.uuid, now_ms);
                }
                PeerUnitState::Paused => {
                    if let Some(category) = runtime.unit_by_uuid(req.uuid).map(|u| u.category) {
                        runtime.pause_category(category);
                    }
                }
                PeerUnitState::Cleared => {
                    let category = runtime.unit_by_uuid(req.uuid).map(|u| u.category);
                    if let Some(category) = category {
                        runtime.pause_category(category);
                    }
                    if let Some(unit) = runtime.unit_by_uuid_mut(req.uuid) {
                        unit.stores.reset();
                    }
                }
                PeerUnitState::None | PeerUnitState::Created => {
                    // No ticker action; acknowledged as a state echo
                }
            }
            Some(NegotiationResponse::ok(
                NegotiationCommand::State,
                req.uuid,
                target.as_u8() as u32,
            ))
        }
        NegotiationCommand::Data => {
            // Reserved command: acknowledged no-op
            debug!("{}: DATA negotiation no-op", runtime.circuit());
            Some(NegotiationResponse::ok(NegotiationCommand::Data, req.uuid, 0))
        }
    }
}
