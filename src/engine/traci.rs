// src/engine/traci.rs
//
// SimulationEngine over the simulator's TCP control protocol.
//
// Connection establishment is the only place that retries. Per-step commands
// are sent exactly once; a failure is reported to the caller, which decides
// whether it is signal-local or fatal.
//
// The protocol has no change notification, so program changes are found by
// polling each cached signal's current program id once per step.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::codec::{self, Decoder, TraciValue};
use super::{EngineError, SimulationEngine};
use crate::config::EngineConfig;
use crate::types::{LaneId, PhaseProgram, SignalId, VehicleId};

/// Upper bound on a single response, guards against garbage length headers.
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

pub struct TraciEngine {
    stream: Option<TcpStream>,
    child: Option<Child>,
    addr: String,
    /// Program id each signal was running when its program was last fetched.
    program_ids: BTreeMap<SignalId, String>,
}

impl TraciEngine {
    /// Optionally spawn the simulator, then connect with retries.
    pub fn connect(cfg: &EngineConfig) -> Result<Self, EngineError> {
        let child = match &cfg.binary {
            Some(binary) => Some(spawn_simulator(binary, cfg)?),
            None => None,
        };

        let addr = cfg.address();
        let attempts = cfg.connect_retries.max(1);
        let delay = Duration::from_millis(cfg.retry_delay_ms);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!(%addr, attempt, "connected to simulation engine");
                    let mut engine = Self {
                        stream: Some(stream),
                        child,
                        addr,
                        program_ids: BTreeMap::new(),
                    };
                    engine.log_version();
                    return Ok(engine);
                }
                Err(e) => {
                    if attempt < attempts {
                        warn!(%addr, attempt, attempts, error = %e, "engine not reachable; retrying");
                        thread::sleep(delay);
                    }
                    last_err = Some(e);
                }
            }
        }

        let mut engine = Self {
            stream: None,
            child,
            addr: addr.clone(),
            program_ids: BTreeMap::new(),
        };
        engine.stop_child();
        Err(EngineError::Connect {
            addr,
            attempts,
            source: last_err
                .unwrap_or_else(|| std::io::Error::other("no connection attempt was made")),
        })
    }

    /// Wrap an already-connected stream (no child process).
    pub fn from_stream(stream: TcpStream) -> Self {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream: Some(stream),
            child: None,
            addr,
            program_ids: BTreeMap::new(),
        }
    }

    fn log_version(&mut self) {
        match self.round_trip(codec::CMD_GETVERSION, &[]) {
            Ok(body) => {
                let mut dec = Decoder::new(&body);
                let parsed = dec
                    .status(codec::CMD_GETVERSION)
                    .and_then(|_| dec.command_header())
                    .and_then(|_| dec.i32())
                    .and_then(|api| dec.string().map(|ident| (api, ident)));
                match parsed {
                    Ok((api, ident)) => info!(api, ident = %ident, "engine version"),
                    Err(e) => debug!(error = %e, "could not decode engine version"),
                }
            }
            Err(e) => debug!(error = %e, "engine version query failed"),
        }
    }

    /// Send one command and return the raw response body.
    fn round_trip(&mut self, command: u8, content: &[u8]) -> Result<Vec<u8>, EngineError> {
        let stream = self.stream.as_mut().ok_or(EngineError::Closed)?;
        let message = codec::encode_message(&codec::encode_command(command, content));
        stream.write_all(&message)?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let total = i32::from_be_bytes(header);
        let body_len = usize::try_from(total)
            .ok()
            .and_then(|t| t.checked_sub(4))
            .filter(|n| *n <= MAX_MESSAGE_BYTES)
            .ok_or_else(|| EngineError::Protocol(format!("bad message length {total}")))?;

        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body)?;
        Ok(body)
    }

    /// Send a command whose response carries only a status.
    fn command(&mut self, command: u8, content: &[u8]) -> Result<(), EngineError> {
        let body = self.round_trip(command, content)?;
        Decoder::new(&body).status(command)
    }

    fn get(&mut self, get_command: u8, variable: u8, object_id: &str) -> Result<TraciValue, EngineError> {
        let body = self.round_trip(get_command, &codec::get_content(variable, object_id))?;
        let mut dec = Decoder::new(&body);
        dec.status(get_command)?;
        dec.get_response(get_command, variable)
    }

    fn current_program_id(&mut self, signal: &str) -> Result<String, EngineError> {
        let value = self.get(codec::CMD_GET_TL_VARIABLE, codec::TL_CURRENT_PROGRAM, signal)?;
        codec::expect_string(value)
    }

    fn stop_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!(%status, "simulator already exited"),
                _ => {
                    if let Err(e) = child.kill() {
                        warn!(error = %e, "failed to stop simulator process");
                    }
                    let _ = child.wait();
                    info!("simulator process stopped");
                }
            }
        }
    }
}

fn spawn_simulator(binary: &str, cfg: &EngineConfig) -> Result<Child, EngineError> {
    let mut cmd = Command::new(binary);
    if let Some(config_file) = &cfg.config_file {
        cmd.arg("-c").arg(config_file);
    }
    cmd.arg("--remote-port")
        .arg(cfg.port.to_string())
        .args(["--start", "--quit-on-end", "--no-warnings", "true"])
        .stdin(Stdio::null());

    info!(binary, port = cfg.port, "spawning simulator");
    cmd.spawn().map_err(|source| EngineError::Spawn {
        binary: binary.to_string(),
        source,
    })
}

fn non_negative(v: i32, what: &str) -> Result<u64, EngineError> {
    u64::try_from(v).map_err(|_| EngineError::Protocol(format!("negative {what}: {v}")))
}

impl SimulationEngine for TraciEngine {
    fn advance_step(&mut self) -> Result<(), EngineError> {
        let mut content = codec::Encoder::new();
        // Target time 0 advances exactly one step.
        content.f64(0.0);
        let body = self.round_trip(codec::CMD_SIMSTEP, &content.into_inner())?;
        Decoder::new(&body).status(codec::CMD_SIMSTEP)
    }

    fn remaining_activity(&mut self) -> Result<bool, EngineError> {
        let value = self.get(
            codec::CMD_GET_SIM_VARIABLE,
            codec::VAR_MIN_EXPECTED_VEHICLES,
            "",
        )?;
        Ok(codec::expect_int(value)? > 0)
    }

    fn signal_ids(&mut self) -> Result<Vec<SignalId>, EngineError> {
        let value = self.get(codec::CMD_GET_TL_VARIABLE, codec::ID_LIST, "")?;
        codec::expect_string_list(value)
    }

    fn controlled_lanes(&mut self, signal: &str) -> Result<Vec<LaneId>, EngineError> {
        let value = self.get(
            codec::CMD_GET_TL_VARIABLE,
            codec::TL_CONTROLLED_LANES,
            signal,
        )?;
        codec::expect_string_list(value)
    }

    fn halted_count(&mut self, lane: &str) -> Result<u64, EngineError> {
        let value = self.get(
            codec::CMD_GET_LANE_VARIABLE,
            codec::LAST_STEP_VEHICLE_HALTING_NUMBER,
            lane,
        )?;
        non_negative(codec::expect_int(value)?, "halting number")
    }

    fn vehicle_ids_on_lane(&mut self, lane: &str) -> Result<Vec<VehicleId>, EngineError> {
        let value = self.get(
            codec::CMD_GET_LANE_VARIABLE,
            codec::LAST_STEP_VEHICLE_ID_LIST,
            lane,
        )?;
        codec::expect_string_list(value)
    }

    fn phase_program(&mut self, signal: &str) -> Result<PhaseProgram, EngineError> {
        let program_id = self.current_program_id(signal)?;
        let value = self.get(
            codec::CMD_GET_TL_VARIABLE,
            codec::TL_COMPLETE_DEFINITION_RYG,
            signal,
        )?;
        let program = codec::parse_program_definition(&value)?;
        self.program_ids.insert(signal.to_string(), program_id);
        Ok(program)
    }

    fn active_phase_index(&mut self, signal: &str) -> Result<usize, EngineError> {
        let value = self.get(codec::CMD_GET_TL_VARIABLE, codec::TL_CURRENT_PHASE, signal)?;
        Ok(non_negative(codec::expect_int(value)?, "phase index")? as usize)
    }

    fn set_active_phase_index(&mut self, signal: &str, index: usize) -> Result<(), EngineError> {
        let index = i32::try_from(index)
            .map_err(|_| EngineError::Protocol(format!("phase index {index} too large")))?;
        self.command(
            codec::CMD_SET_TL_VARIABLE,
            &codec::set_int_content(codec::TL_PHASE_INDEX, signal, index),
        )
    }

    fn disable_signal(&mut self, signal: &str) -> Result<(), EngineError> {
        self.program_ids.remove(signal);
        self.command(
            codec::CMD_SET_TL_VARIABLE,
            &codec::set_string_content(codec::TL_PROGRAM, signal, "off"),
        )
    }

    /// Signals whose running program id differs from the one last seen.
    fn take_program_changes(&mut self) -> Vec<SignalId> {
        let known: Vec<(SignalId, String)> = self
            .program_ids
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut changed = Vec::new();
        for (signal, seen) in known {
            match self.current_program_id(&signal) {
                Ok(current) if current != seen => {
                    debug!(signal = %signal, from = %seen, to = %current, "program id changed");
                    self.program_ids.insert(signal.clone(), current);
                    changed.push(signal);
                }
                Ok(_) => {}
                Err(e) => debug!(signal = %signal, error = %e, "program id poll failed"),
            }
        }
        changed
    }

    fn close(&mut self) -> Result<(), EngineError> {
        let result = if self.stream.is_some() {
            let res = self.command(codec::CMD_CLOSE, &[]);
            self.stream = None;
            res
        } else {
            Ok(())
        };
        self.stop_child();
        info!(addr = %self.addr, "engine connection closed");
        result
    }

    fn name(&self) -> &str {
        "traci"
    }
}

impl Drop for TraciEngine {
    fn drop(&mut self) {
        self.stop_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Serve exactly one request with a canned body.
    fn serve_once(body: Vec<u8>) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; 4];
            sock.read_exact(&mut header).unwrap();
            let len = i32::from_be_bytes(header) as usize - 4;
            let mut req = vec![0u8; len];
            sock.read_exact(&mut req).unwrap();
            sock.write_all(&codec::encode_message(&body)).unwrap();
            req
        });
        (addr, handle)
    }

    #[test]
    fn halted_count_round_trip() {
        let mut status = codec::Encoder::new();
        status.u8(codec::RTYPE_OK).string("");
        let mut body = codec::encode_command(codec::CMD_GET_LANE_VARIABLE, &status.into_inner());
        let mut resp = codec::Encoder::new();
        resp.u8(codec::LAST_STEP_VEHICLE_HALTING_NUMBER)
            .string("lane_0")
            .u8(codec::TYPE_INTEGER)
            .i32(7);
        body.extend(codec::encode_command(
            codec::response_id(codec::CMD_GET_LANE_VARIABLE),
            &resp.into_inner(),
        ));

        let (addr, handle) = serve_once(body);
        let stream = TcpStream::connect(addr).unwrap();
        let mut engine = TraciEngine::from_stream(stream);
        assert_eq!(engine.halted_count("lane_0").unwrap(), 7);

        let req = handle.join().unwrap();
        assert_eq!(req[1], codec::CMD_GET_LANE_VARIABLE);
        assert_eq!(req[2], codec::LAST_STEP_VEHICLE_HALTING_NUMBER);
    }

    /// Serve one request per canned body, in order, on a single connection.
    fn serve_each(bodies: Vec<Vec<u8>>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            for body in bodies {
                let mut header = [0u8; 4];
                sock.read_exact(&mut header).unwrap();
                let mut req = vec![0u8; i32::from_be_bytes(header) as usize - 4];
                sock.read_exact(&mut req).unwrap();
                sock.write_all(&codec::encode_message(&body)).unwrap();
            }
        });
        (addr, handle)
    }

    fn program_id_response(signal: &str, id: &str) -> Vec<u8> {
        let mut status = codec::Encoder::new();
        status.u8(codec::RTYPE_OK).string("");
        let mut body = codec::encode_command(codec::CMD_GET_TL_VARIABLE, &status.into_inner());
        let mut resp = codec::Encoder::new();
        resp.u8(codec::TL_CURRENT_PROGRAM)
            .string(signal)
            .u8(codec::TYPE_STRING)
            .string(id);
        body.extend(codec::encode_command(
            codec::response_id(codec::CMD_GET_TL_VARIABLE),
            &resp.into_inner(),
        ));
        body
    }

    #[test]
    fn program_id_change_is_reported_once() {
        let (addr, handle) = serve_each(vec![
            program_id_response("J1", "0"),
            program_id_response("J1", "night"),
            program_id_response("J1", "night"),
        ]);
        let mut engine = TraciEngine::from_stream(TcpStream::connect(addr).unwrap());
        engine.program_ids.insert("J1".to_string(), "0".to_string());

        assert!(engine.take_program_changes().is_empty());
        assert_eq!(engine.take_program_changes(), vec!["J1".to_string()]);
        assert!(engine.take_program_changes().is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn rejected_set_is_reported() {
        let mut status = codec::Encoder::new();
        status.u8(codec::RTYPE_ERR).string("index out of range");
        let body = codec::encode_command(codec::CMD_SET_TL_VARIABLE, &status.into_inner());

        let (addr, handle) = serve_once(body);
        let mut engine = TraciEngine::from_stream(TcpStream::connect(addr).unwrap());
        let err = engine.set_active_phase_index("J1", 9).unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed { .. }));
        handle.join().unwrap();
    }

    #[test]
    fn connect_gives_up_after_retries() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let cfg = EngineConfig {
            port,
            connect_retries: 2,
            retry_delay_ms: 1,
            ..EngineConfig::default()
        };
        match TraciEngine::connect(&cfg) {
            Err(EngineError::Connect { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
