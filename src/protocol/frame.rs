use anyhow::{anyhow, Result};
use rmodbus::{client::ModbusRequest, ModbusProto};

const FUNC_READ_HOLDINGS: u8 = 0x03;
const FUNC_WRITE_HOLDING: u8 = 0x06;

/// Build a frame to read `count` holding registers (function 0x03)
pub fn generate_get_holdings_request(
    slave_id: u8,
    address: u16,
    count: u16,
) -> Result<(ModbusRequest, Vec<u8>)> {
    let mut request = ModbusRequest::new(slave_id, ModbusProto::Rtu);
    let mut raw = Vec::new();
    request.generate_get_holdings(address, count, &mut raw)?;
    Ok((request, raw))
}

/// Build a frame to write a single holding register (function 0x06)
pub fn generate_set_holding_request(
    slave_id: u8,
    address: u16,
    value: u16,
) -> Result<(ModbusRequest, Vec<u8>)> {
    let mut request = ModbusRequest::new(slave_id, ModbusProto::Rtu);
    let mut raw = Vec::new();
    request.generate_set_holding(address, value, &mut raw)?;
    Ok((request, raw))
}

/// Full RTU reply length for a read of `count` holding registers.
pub fn read_holdings_response_len(count: u16) -> usize {
    // addr(1) + func(1) + byte count(1) + data(2N) + CRC(2)
    3 + count as usize * 2 + 2
}

/// A write-single-register reply echoes the 8-byte request.
pub const WRITE_HOLDING_RESPONSE_LEN: usize = 8;

/// An exception reply is addr(1) + func|0x80(1) + code(1) + CRC(2).
pub const EXCEPTION_RESPONSE_LEN: usize = 5;

/// Exception code if `response` is a Modbus exception reply.
pub fn exception_code(response: &[u8]) -> Option<u8> {
    if response.len() >= 3 && response[1] & 0x80 != 0 {
        Some(response[2])
    } else {
        None
    }
}

/// How many bytes the reply needs given what has arrived so far.
pub fn expected_len(partial: &[u8], full_len: usize) -> usize {
    if partial.len() >= 2 && partial[1] & 0x80 != 0 {
        EXCEPTION_RESPONSE_LEN
    } else {
        full_len
    }
}

pub fn parse_get_holdings_response(
    request: &mut ModbusRequest,
    response: &[u8],
    count: u16,
) -> Result<Vec<u16>> {
    if response.len() < EXCEPTION_RESPONSE_LEN {
        return Err(anyhow!("Response too short: {} bytes", response.len()));
    }
    if response[1] != FUNC_READ_HOLDINGS {
        return Err(anyhow!(
            "Function code mismatch: expected 0x{FUNC_READ_HOLDINGS:02X}, got 0x{:02X}",
            response[1]
        ));
    }
    request.parse_ok(response)?;

    let byte_count = response[2] as usize;
    if byte_count != count as usize * 2 || response.len() < 3 + byte_count + 2 {
        return Err(anyhow!(
            "Byte count mismatch: expected {}, got {byte_count}",
            count as usize * 2
        ));
    }

    let values = response[3..3 + byte_count]
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect::<Vec<_>>();
    Ok(values)
}

pub fn parse_set_holding_response(request: &mut ModbusRequest, response: &[u8]) -> Result<()> {
    if response.len() < WRITE_HOLDING_RESPONSE_LEN {
        return Err(anyhow!("Response too short: {} bytes", response.len()));
    }
    if response[1] != FUNC_WRITE_HOLDING {
        return Err(anyhow!(
            "Function code mismatch: expected 0x{FUNC_WRITE_HOLDING:02X}, got 0x{:02X}",
            response[1]
        ));
    }
    request.parse_ok(response)?;
    Ok(())
}

pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
