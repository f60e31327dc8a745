//! Read-only Modbus/TCP view of the sensor cache and processor snapshots.
//!
//! Three address ranges share the wire, each reinterpreting the MBAP unit
//! identifier differently:
//!
//! - `[0, 10000)`: per-device "base map" — one compact `u16` register per
//!   quantity, scaled through a [`BaseScale`]. Unit id selects the device
//!   (index, or `0xFF` for device 0).
//! - `[10000, 20000)`: per-device "plain map" — the same device's quantities
//!   as full-precision IEEE-754 doubles, 4 registers each, unit id as above.
//! - `[20000, ..)`: per-processor map. Unit id selects the *processor*
//!   index; each register is whatever that processor precomputed for
//!   [`ProcessorSnapshot::registers`].
//!
//! A request for an unknown unit id gets back all-zero registers rather than
//! an exception, matching a gateway that would rather report "nothing here"
//! than refuse to answer.
//!
//! The framing is hand-rolled MBAP/Modbus-TCP parsing directly over
//! [`tokio::net::TcpListener`], in the same spirit as the XSens/u-blox frame
//! parsers in `sensorhub_core::parser`: a fixed binary header, a length
//! field, and a handful of function codes, read byte-for-byte rather than
//! through an intermediate framework.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sensorhub_core::quantity::Quantity;
use sensorhub_core::scale::BaseScale;
use sensorhub_core::snapshot::{DeviceSnapshot, SharedState, StateSnapshot};

const FUNC_READ_HOLDING_REGISTERS: u8 = 0x03;
const FUNC_READ_INPUT_REGISTERS: u8 = 0x04;

const EXC_ILLEGAL_FUNCTION: u8 = 0x01;
const EXC_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

const BASE_MAP_START: u32 = 0;
const PLAIN_MAP_START: u32 = 10_000;
const PROCESSOR_MAP_START: u32 = 20_000;

const UNIT_ID_DEFAULT_DEVICE: u8 = 0xFF;

/// Per-quantity scaler plus whatever else a request handler needs that
/// doesn't change per tick.
struct ViewState {
    shared: SharedState,
    scale: BaseScale,
}

/// Pack the crate's `major.minor` version into one register, high byte
/// major, low byte minor (patch is dropped — not worth a register).
fn pack_semver() -> u16 {
    let mut parts = sensorhub_core::VERSION.split('.');
    let major: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major << 8) | (minor & 0xFF)
}

/// Build one device's base map: register 0 is the packed semver, 1-2/3-4/5-6
/// are `ut`/`la`/`lo` scaled to full `u32` width and split hi/lo, and 7.. is
/// one `u16` register per quantity from [`Quantity::ALL`]`[4..]` (i.e.
/// starting at `hmsl`), scaled through `scale`.
fn build_base_registers(device: &DeviceSnapshot, scale: &BaseScale) -> Vec<u16> {
    let mut registers = vec![pack_semver()];
    for quantity in [Quantity::ut, Quantity::la, Quantity::lo] {
        let value = device.data.get(quantity.name()).map(|s| s.value).unwrap_or(0.0);
        let scaled: u32 = scale.scale_to(quantity, value);
        registers.push((scaled >> 16) as u16);
        registers.push((scaled & 0xFFFF) as u16);
    }
    for quantity in &Quantity::ALL[4..] {
        let value = device.data.get(quantity.name()).map(|s| s.value).unwrap_or(0.0);
        registers.push(scale.scale_to(*quantity, value));
    }
    registers
}

/// Build one device's plain map: every quantity in catalogue order, as a
/// big-endian IEEE-754 double spread across 4 registers, followed by 3
/// unused registers reserved for future per-quantity metadata.
fn build_plain_registers(device: &DeviceSnapshot) -> Vec<u16> {
    let mut registers = Vec::with_capacity(Quantity::ALL.len() * 7);
    for quantity in Quantity::ALL {
        let value = device.data.get(quantity.name()).map(|s| s.value).unwrap_or(0.0);
        let bits = value.to_bits();
        registers.push((bits >> 48) as u16);
        registers.push((bits >> 32) as u16);
        registers.push((bits >> 16) as u16);
        registers.push(bits as u16);
        registers.extend([0u16, 0, 0]);
    }
    registers
}

fn resolve_device(state: &StateSnapshot, unit_id: u8) -> Option<&DeviceSnapshot> {
    let index = if unit_id == UNIT_ID_DEFAULT_DEVICE { 0 } else { unit_id as usize };
    state.devices.get(index)
}

/// Slice `registers[offset..offset+count]`, or `None` if the request runs
/// past the end of the backing array (illegal data address).
fn slice_registers(registers: &[u16], offset: usize, count: usize) -> Option<Vec<u16>> {
    registers.get(offset..offset.checked_add(count)?).map(|s| s.to_vec())
}

/// Look up the registers a read request resolves to. `Ok(None)` means
/// "respond with zeros" (unknown unit id); `Err(exception)` means a protocol
/// exception response.
fn handle_read(state: &ViewState, unit_id: u8, address: u32, count: u32) -> Result<Option<Vec<u16>>, u8> {
    let snapshot = state.shared.lock().unwrap();
    if address < PLAIN_MAP_START {
        let Some(device) = resolve_device(&snapshot, unit_id) else { return Ok(None) };
        let registers = build_base_registers(device, &state.scale);
        let offset = (address - BASE_MAP_START) as usize;
        slice_registers(&registers, offset, count as usize).map(Some).ok_or(EXC_ILLEGAL_DATA_ADDRESS)
    } else if address < PROCESSOR_MAP_START {
        let Some(device) = resolve_device(&snapshot, unit_id) else { return Ok(None) };
        let registers = build_plain_registers(device);
        let offset = (address - PLAIN_MAP_START) as usize;
        slice_registers(&registers, offset, count as usize).map(Some).ok_or(EXC_ILLEGAL_DATA_ADDRESS)
    } else {
        let Some(processor) = snapshot.processors.get(unit_id as usize) else { return Ok(None) };
        let offset = (address - PROCESSOR_MAP_START) as usize;
        slice_registers(&processor.registers, offset, count as usize).map(Some).ok_or(EXC_ILLEGAL_DATA_ADDRESS)
    }
}

/// Read one MBAP+PDU request from `stream`: `(transaction_id, unit_id,
/// function_code, address, count)`.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<(u16, u8, u8, u16, u16)> {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await?;
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let unit_id = header[6];

    let mut pdu = vec![0u8; length.saturating_sub(1)];
    stream.read_exact(&mut pdu).await?;

    let function_code = pdu.first().copied().unwrap_or(0);
    let address = pdu.get(1..3).map(|b| u16::from_be_bytes([b[0], b[1]])).unwrap_or(0);
    let count = pdu.get(3..5).map(|b| u16::from_be_bytes([b[0], b[1]])).unwrap_or(0);
    Ok((transaction_id, unit_id, function_code, address, count))
}

fn write_response(transaction_id: u16, unit_id: u8, function_code: u8, registers: &[u16]) -> Vec<u8> {
    let byte_count = (registers.len() * 2) as u8;
    let mut pdu = vec![function_code, byte_count];
    for register in registers {
        pdu.extend_from_slice(&register.to_be_bytes());
    }
    frame(transaction_id, unit_id, &pdu)
}

fn write_exception(transaction_id: u16, unit_id: u8, function_code: u8, exception: u8) -> Vec<u8> {
    frame(transaction_id, unit_id, &[function_code | 0x80, exception])
}

fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // protocol id, always 0 for Modbus
    out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out.push(unit_id);
    out.extend_from_slice(pdu);
    out
}

async fn serve_connection(mut stream: TcpStream, state: Arc<ViewState>) {
    loop {
        let (transaction_id, unit_id, function_code, address, count) = match read_request(&mut stream).await {
            Ok(request) => request,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                debug!("modbus connection read error: {e}");
                return;
            }
        };

        let response = if !matches!(function_code, FUNC_READ_HOLDING_REGISTERS | FUNC_READ_INPUT_REGISTERS) {
            write_exception(transaction_id, unit_id, function_code, EXC_ILLEGAL_FUNCTION)
        } else {
            match handle_read(&state, unit_id, address as u32, count as u32) {
                Ok(Some(registers)) => write_response(transaction_id, unit_id, function_code, &registers),
                Ok(None) => write_response(transaction_id, unit_id, function_code, &vec![0u16; count as usize]),
                Err(exception) => write_exception(transaction_id, unit_id, function_code, exception),
            }
        };

        if let Err(e) = stream.write_all(&response).await {
            debug!("modbus connection write error: {e}");
            return;
        }
    }
}

/// Run the Modbus/TCP view server, serving until the process is terminated.
pub async fn run_server(shared: SharedState, address: &str, port: u16) {
    let state = Arc::new(ViewState { shared, scale: BaseScale::with_defaults() });
    let addr = format!("{address}:{port}");
    let listener = TcpListener::bind(&addr).await.expect("failed to bind Modbus/TCP listener");
    info!("Modbus/TCP view listening on {addr}");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("modbus connection from {peer}");
                let state = state.clone();
                tokio::spawn(serve_connection(stream, state));
            }
            Err(e) => warn!("failed to accept modbus connection: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorhub_core::snapshot::{new_shared_state, ProcessorSnapshot, QuantitySample};
    use std::collections::BTreeMap;

    fn state_with_one_device() -> Arc<ViewState> {
        let shared = new_shared_state();
        let mut data = BTreeMap::new();
        data.insert("ax".to_string(), QuantitySample { time: 1.0, value: 2.0 });
        let mut snapshot = StateSnapshot::default();
        snapshot.devices.push(DeviceSnapshot {
            id: "device0_id".to_string(),
            name: "MTi-G-710".to_string(),
            connected: true,
            time: 1.0,
            data,
        });
        snapshot.processors.push(ProcessorSnapshot {
            name: "stats0".to_string(),
            json: "{}".to_string(),
            registers: vec![0xAAAA, 0xBBBB, 0xCCCC],
        });
        *shared.lock().unwrap() = snapshot;
        Arc::new(ViewState { shared, scale: BaseScale::with_defaults() })
    }

    #[test]
    fn base_map_unit_id_0xff_resolves_device_zero() {
        let state = state_with_one_device();
        let registers = handle_read(&state, 0xFF, 0, 1).unwrap().unwrap();
        assert_eq!(registers.len(), 1);
        assert_eq!(registers[0], pack_semver());
    }

    #[test]
    fn unknown_unit_id_returns_none_not_an_exception() {
        let state = state_with_one_device();
        assert_eq!(handle_read(&state, 5, 0, 1).unwrap(), None);
    }

    #[test]
    fn plain_map_round_trips_a_double() {
        let state = state_with_one_device();
        let snapshot = state.shared.lock().unwrap();
        let registers = build_plain_registers(&snapshot.devices[0]);
        drop(snapshot);
        // 'ax' is the 20th quantity (index 19); its block starts at 19*7.
        let offset = 19 * 7;
        let bits = ((registers[offset] as u64) << 48)
            | ((registers[offset + 1] as u64) << 32)
            | ((registers[offset + 2] as u64) << 16)
            | (registers[offset + 3] as u64);
        assert_eq!(f64::from_bits(bits), 2.0);
    }

    #[test]
    fn processor_map_reads_precomputed_registers() {
        let state = state_with_one_device();
        let registers = handle_read(&state, 0, PROCESSOR_MAP_START as u32, 3).unwrap().unwrap();
        assert_eq!(registers, vec![0xAAAA, 0xBBBB, 0xCCCC]);
    }

    #[test]
    fn out_of_range_count_is_illegal_data_address() {
        let state = state_with_one_device();
        let err = handle_read(&state, 0, PROCESSOR_MAP_START as u32, 100).unwrap_err();
        assert_eq!(err, EXC_ILLEGAL_DATA_ADDRESS);
    }

    /// After the device reports `ut=1000, la=0, lo=0`, a read of input
    /// registers 0..6 splits each of `ut`/`la`/`lo` into a high/low register
    /// pair: `ut`'s pair carries the raw value (1000 fits entirely in the
    /// low register), while `la`/`lo`'s zero-centred `(-pi, pi)` bounds put
    /// their midpoint's top bit in the *high* register of the pair (the
    /// low register comes out zero), since `scale_to::<u32>` splits the
    /// same 32-bit scaled value the `ut` pair does, not a 16-bit value
    /// placed in the low half.
    #[test]
    fn base_map_of_device_0_reports_ut_la_lo_as_hi_lo_register_pairs() {
        let shared = new_shared_state();
        let mut data = BTreeMap::new();
        data.insert("ut".to_string(), QuantitySample { time: 1.0, value: 1000.0 });
        data.insert("la".to_string(), QuantitySample { time: 1.0, value: 0.0 });
        data.insert("lo".to_string(), QuantitySample { time: 1.0, value: 0.0 });
        let mut snapshot = StateSnapshot::default();
        snapshot.devices.push(DeviceSnapshot {
            id: "device0_id".to_string(),
            name: "MTi-G-710".to_string(),
            connected: true,
            time: 1.0,
            data,
        });
        *shared.lock().unwrap() = snapshot;
        let state = Arc::new(ViewState { shared, scale: BaseScale::with_defaults() });

        let registers = handle_read(&state, 0xFF, 0, 7).unwrap().unwrap();
        assert_eq!(registers[0], pack_semver());
        assert_eq!(&registers[1..3], &[0, 1000]); // ut: (1000 >> 16) & 0xFFFF, 1000 & 0xFFFF
        assert_eq!(&registers[3..5], &[0x8000, 0]); // la: zero maps to the midpoint's top bit
        assert_eq!(&registers[5..7], &[0x8000, 0]); // lo: same zero-centred convention
    }

    #[test]
    fn response_frame_has_mbap_header_and_echoed_transaction_id() {
        let frame = write_response(42, 3, FUNC_READ_HOLDING_REGISTERS, &[0x1234]);
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 42);
        assert_eq!(frame[6], 3);
        assert_eq!(frame[7], FUNC_READ_HOLDING_REGISTERS);
    }
}
