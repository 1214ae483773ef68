/// Modbus TCP (MBAP) framing and PDU encoding
///
/// ```text
/// ┌──────────────┬─────────────┬────────┬─────────┬───────────────┐
/// │ Transaction  │ Protocol ID │ Length │ Unit ID │ PDU           │
/// │ 2 bytes      │ 2 bytes (0) │ 2 bytes│ 1 byte  │ Length-1 bytes│
/// └──────────────┴─────────────┴────────┴─────────┴───────────────┘
/// ```
///
/// [`MbapCodec`] splits a byte stream into frames for `tokio_util::codec::Framed`
/// and writes reply frames back. Header violations are framing errors and end the
/// connection. Everything inside the PDU is checked by [`decode_request`], which
/// answers with a Modbus exception instead.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    data_utils, ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, UnitId,
};
use crate::{
    MAX_COILS_PER_REQUEST, MAX_COILS_PER_WRITE, MAX_REGISTERS_PER_REQUEST,
    MAX_REGISTERS_PER_WRITE,
};

/// MBAP header length including the unit identifier
pub const MBAP_HEADER_SIZE: usize = 7;

/// Largest PDU a Modbus TCP frame can carry
pub const MAX_PDU_SIZE: usize = 253;

/// Smallest legal value of the MBAP length field (unit id + function code)
const MIN_MBAP_LENGTH: u16 = 2;

/// Largest legal value of the MBAP length field (unit id + PDU)
const MAX_MBAP_LENGTH: u16 = MAX_PDU_SIZE as u16 + 1;

/// Coil value for ON in a write single coil request
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// MBAP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: UnitId,
}

/// One Modbus TCP frame: header plus PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapFrame {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

impl MbapFrame {
    pub fn new(transaction_id: u16, unit_id: UnitId, pdu: impl Into<Bytes>) -> Self {
        let pdu = pdu.into();
        Self {
            header: MbapHeader {
                transaction_id,
                protocol_id: 0,
                length: pdu.len() as u16 + 1,
                unit_id,
            },
            pdu,
        }
    }

    /// Raw function code of the PDU
    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or(0)
    }

    /// Build the reply frame, echoing transaction and unit identifiers
    pub fn reply(&self, pdu: impl Into<Bytes>) -> MbapFrame {
        MbapFrame::new(self.header.transaction_id, self.header.unit_id, pdu)
    }

    /// Serialize header and PDU
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_SIZE + self.pdu.len());
        write_frame(self, &mut buf);
        buf.freeze()
    }
}

fn write_frame(frame: &MbapFrame, dst: &mut BytesMut) {
    dst.reserve(MBAP_HEADER_SIZE + frame.pdu.len());
    dst.put_u16(frame.header.transaction_id);
    dst.put_u16(0);
    dst.put_u16(frame.pdu.len() as u16 + 1);
    dst.put_u8(frame.header.unit_id);
    dst.put_slice(&frame.pdu);
}

/// Server-side MBAP codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> ModbusResult<Option<MbapFrame>> {
        if src.len() < MBAP_HEADER_SIZE {
            return Ok(None);
        }

        let transaction_id = u16::from_be_bytes([src[0], src[1]]);
        let protocol_id = u16::from_be_bytes([src[2], src[3]]);
        let length = u16::from_be_bytes([src[4], src[5]]);

        if protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "protocol identifier must be 0, got {}",
                protocol_id
            )));
        }
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::frame(format!(
                "MBAP length {} outside {}..={}",
                length, MIN_MBAP_LENGTH, MAX_MBAP_LENGTH
            )));
        }

        let frame_len = MBAP_HEADER_SIZE - 1 + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let unit_id = frame[6];
        frame.advance(MBAP_HEADER_SIZE);

        Ok(Some(MbapFrame {
            header: MbapHeader {
                transaction_id,
                protocol_id,
                length,
                unit_id,
            },
            pdu: frame.freeze(),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> ModbusResult<Option<MbapFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ModbusError::frame(format!(
                "connection closed with {} bytes of an incomplete frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<MbapFrame> for MbapCodec {
    type Error = ModbusError;

    fn encode(&mut self, frame: MbapFrame, dst: &mut BytesMut) -> ModbusResult<()> {
        if frame.pdu.is_empty() || frame.pdu.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!("invalid PDU length {}", frame.pdu.len())));
        }
        write_frame(&frame, dst);
        Ok(())
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, ModbusException> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or(ModbusException::IllegalDataValue)
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), ModbusException> {
    if quantity == 0 || quantity > max {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(())
}

/// Decode a request PDU
///
/// Unsupported function codes answer `IllegalFunction`; malformed bodies and
/// quantities outside the Modbus limits answer `IllegalDataValue`.
pub fn decode_request(pdu: &[u8]) -> Result<ModbusRequest, ModbusException> {
    let (&code, body) = pdu.split_first().ok_or(ModbusException::IllegalFunction)?;
    let function = ModbusFunction::from_u8(code)?;

    match function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => {
            if body.len() != 4 {
                return Err(ModbusException::IllegalDataValue);
            }
            let address = read_u16(body, 0)?;
            let quantity = read_u16(body, 2)?;
            Ok(match function {
                ModbusFunction::ReadCoils => {
                    check_quantity(quantity, MAX_COILS_PER_REQUEST)?;
                    ModbusRequest::ReadCoils { address, quantity }
                }
                ModbusFunction::ReadDiscreteInputs => {
                    check_quantity(quantity, MAX_COILS_PER_REQUEST)?;
                    ModbusRequest::ReadDiscreteInputs { address, quantity }
                }
                ModbusFunction::ReadHoldingRegisters => {
                    check_quantity(quantity, MAX_REGISTERS_PER_REQUEST)?;
                    ModbusRequest::ReadHoldingRegisters { address, quantity }
                }
                _ => {
                    check_quantity(quantity, MAX_REGISTERS_PER_REQUEST)?;
                    ModbusRequest::ReadInputRegisters { address, quantity }
                }
            })
        }
        ModbusFunction::WriteSingleCoil => {
            if body.len() != 4 {
                return Err(ModbusException::IllegalDataValue);
            }
            let address = read_u16(body, 0)?;
            let value = match read_u16(body, 2)? {
                COIL_ON => true,
                COIL_OFF => false,
                _ => return Err(ModbusException::IllegalDataValue),
            };
            Ok(ModbusRequest::WriteSingleCoil { address, value })
        }
        ModbusFunction::WriteSingleRegister => {
            if body.len() != 4 {
                return Err(ModbusException::IllegalDataValue);
            }
            Ok(ModbusRequest::WriteSingleRegister {
                address: read_u16(body, 0)?,
                value: read_u16(body, 2)?,
            })
        }
        ModbusFunction::WriteMultipleCoils => {
            let address = read_u16(body, 0)?;
            let quantity = read_u16(body, 2)?;
            check_quantity(quantity, MAX_COILS_PER_WRITE)?;
            let data = write_payload(body, (quantity as usize).div_ceil(8))?;
            Ok(ModbusRequest::WriteMultipleCoils {
                address,
                values: data_utils::unpack_bits(data, quantity as usize),
            })
        }
        ModbusFunction::WriteMultipleRegisters => {
            let address = read_u16(body, 0)?;
            let quantity = read_u16(body, 2)?;
            check_quantity(quantity, MAX_REGISTERS_PER_WRITE)?;
            let data = write_payload(body, quantity as usize * 2)?;
            Ok(ModbusRequest::WriteMultipleRegisters {
                address,
                values: data_utils::bytes_to_registers(data),
            })
        }
    }
}

/// Payload of a multiple-write body whose byte count must equal `expected`
fn write_payload(body: &[u8], expected: usize) -> Result<&[u8], ModbusException> {
    let byte_count = *body.get(4).ok_or(ModbusException::IllegalDataValue)? as usize;
    let data = &body[5..];
    if byte_count != expected || data.len() != byte_count {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(data)
}

/// Encode a response PDU
pub fn encode_response(response: &ModbusResponse) -> Bytes {
    let mut pdu = BytesMut::with_capacity(MAX_PDU_SIZE);
    match response {
        ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => {
            let function = if matches!(response, ModbusResponse::ReadCoils(_)) {
                ModbusFunction::ReadCoils
            } else {
                ModbusFunction::ReadDiscreteInputs
            };
            let packed = data_utils::pack_bits(bits);
            pdu.put_u8(function.to_u8());
            pdu.put_u8(packed.len() as u8);
            pdu.put_slice(&packed);
        }
        ModbusResponse::ReadHoldingRegisters(words) | ModbusResponse::ReadInputRegisters(words) => {
            let function = if matches!(response, ModbusResponse::ReadHoldingRegisters(_)) {
                ModbusFunction::ReadHoldingRegisters
            } else {
                ModbusFunction::ReadInputRegisters
            };
            pdu.put_u8(function.to_u8());
            pdu.put_u8((words.len() * 2) as u8);
            pdu.put_slice(&data_utils::registers_to_bytes(words));
        }
        ModbusResponse::WriteSingleCoil { address, value } => {
            pdu.put_u8(ModbusFunction::WriteSingleCoil.to_u8());
            pdu.put_u16(*address);
            pdu.put_u16(if *value { COIL_ON } else { COIL_OFF });
        }
        ModbusResponse::WriteSingleRegister { address, value } => {
            pdu.put_u8(ModbusFunction::WriteSingleRegister.to_u8());
            pdu.put_u16(*address);
            pdu.put_u16(*value);
        }
        ModbusResponse::WriteMultipleCoils { address, quantity } => {
            pdu.put_u8(ModbusFunction::WriteMultipleCoils.to_u8());
            pdu.put_u16(*address);
            pdu.put_u16(*quantity);
        }
        ModbusResponse::WriteMultipleRegisters { address, quantity } => {
            pdu.put_u8(ModbusFunction::WriteMultipleRegisters.to_u8());
            pdu.put_u16(*address);
            pdu.put_u16(*quantity);
        }
        ModbusResponse::Exception { function, exception } => {
            return encode_exception(*function, *exception);
        }
    }
    pdu.freeze()
}

/// Encode an exception PDU for a raw function code
pub fn encode_exception(function: u8, exception: ModbusException) -> Bytes {
    Bytes::from(vec![function | 0x80, exception.to_u8()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_and_partial() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        buf.extend_from_slice(&frame[..9]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 9);

        buf.extend_from_slice(&frame[9..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.transaction_id, 1);
        assert_eq!(decoded.header.unit_id, 1);
        assert_eq!(&decoded.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(
            &[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x08,
                0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x01, 0x2C,
            ][..],
        );
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.transaction_id, 1);
        assert_eq!(second.header.transaction_id, 2);
        assert_eq!(second.function_code(), 0x06);
    }

    #[test]
    fn test_decode_framing_errors() {
        let mut codec = MbapCodec;

        let mut bad_protocol = BytesMut::from(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03][..]);
        assert!(codec.decode(&mut bad_protocol).unwrap_err().is_framing_error());

        let mut short_length = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01][..]);
        assert!(codec.decode(&mut short_length).unwrap_err().is_framing_error());

        let mut long_length = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0x01][..]);
        assert!(codec.decode(&mut long_length).unwrap_err().is_framing_error());
    }

    #[test]
    fn test_decode_eof_with_partial_frame() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03][..]);
        assert!(codec.decode_eof(&mut buf).unwrap_err().is_framing_error());

        let mut empty = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut empty).unwrap(), None);
    }

    #[test]
    fn test_encode_reply_echoes_header() {
        let request = MbapFrame::new(0x1234, 0x11, vec![0x03, 0x00, 0x00, 0x00, 0x01]);
        let reply = request.reply(vec![0x03, 0x02, 0x00, 0x2A]);

        let mut buf = BytesMut::new();
        MbapCodec.encode(reply, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x11, 0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_decode_read_requests() {
        assert_eq!(
            decode_request(&[0x01, 0x00, 0x00, 0x00, 0x08]),
            Ok(ModbusRequest::ReadCoils { address: 0, quantity: 8 })
        );
        assert_eq!(
            decode_request(&[0x04, 0x00, 0x0A, 0x00, 0x7D]),
            Ok(ModbusRequest::ReadInputRegisters { address: 10, quantity: 125 })
        );
        assert_eq!(
            decode_request(&[0x03, 0x00, 0x00, 0x00, 0x7E]),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(
            decode_request(&[0x02, 0x00, 0x00, 0x07, 0xD1]),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(
            decode_request(&[0x01, 0x00, 0x00, 0x00, 0x00]),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(decode_request(&[0x03, 0x00]), Err(ModbusException::IllegalDataValue));
    }

    #[test]
    fn test_decode_write_requests() {
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x03, 0xFF, 0x00]),
            Ok(ModbusRequest::WriteSingleCoil { address: 3, value: true })
        );
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x03, 0x12, 0x34]),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(
            decode_request(&[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0b0000_1001, 0b0000_0010]),
            Ok(ModbusRequest::WriteMultipleCoils {
                address: 0,
                values: vec![true, false, false, true, false, false, false, false, false, true],
            })
        );
        assert_eq!(
            decode_request(&[0x10, 0x00, 0x0A, 0x00, 0x02, 0x04, 0x01, 0x2C, 0x00, 0x01]),
            Ok(ModbusRequest::WriteMultipleRegisters { address: 10, values: vec![300, 1] })
        );
        // byte count disagrees with quantity
        assert_eq!(
            decode_request(&[0x10, 0x00, 0x0A, 0x00, 0x02, 0x02, 0x01, 0x2C]),
            Err(ModbusException::IllegalDataValue)
        );
    }

    #[test]
    fn test_unknown_function() {
        assert_eq!(decode_request(&[0x63, 0x00, 0x00]), Err(ModbusException::IllegalFunction));
        assert_eq!(&encode_exception(0x63, ModbusException::IllegalFunction)[..], &[0xE3, 0x01]);
    }

    #[test]
    fn test_encode_responses() {
        let pdu = encode_response(&ModbusResponse::ReadCoils(vec![
            false, false, false, true, false, false, false, false,
        ]));
        assert_eq!(&pdu[..], &[0x01, 0x01, 0x08]);

        let pdu = encode_response(&ModbusResponse::ReadHoldingRegisters(vec![300]));
        assert_eq!(&pdu[..], &[0x03, 0x02, 0x01, 0x2C]);

        let pdu = encode_response(&ModbusResponse::WriteSingleCoil { address: 3, value: true });
        assert_eq!(&pdu[..], &[0x05, 0x00, 0x03, 0xFF, 0x00]);

        let pdu = encode_response(&ModbusResponse::Exception {
            function: 0x03,
            exception: ModbusException::IllegalDataAddress,
        });
        assert_eq!(&pdu[..], &[0x83, 0x02]);
    }
}
