//! Bit-exact record serialization.
//!
//! All integers are big-endian so that lexicographic key iteration equals
//! numeric iteration. The codec is pure: no I/O and no time source, so
//! migrations can replay historical bytes deterministically.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{BlockHash, OutPoint, Txid};

use crate::error::Error;

/// Encoded outpoint width: 32-byte txid plus big-endian u32 output index.
pub(crate) const OUTPOINT_SIZE: usize = 36;
/// Compressed secp256k1 public key width.
pub(crate) const PUBKEY_SIZE: usize = 33;

const ADDR_TYPE_IPV4: u8 = 1;
const ADDR_TYPE_IPV6: u8 = 2;

fn truncated() -> Error {
    Error::codec("unexpected end of record")
}

/// A cursor over serialized record bytes.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume and return everything left in the record.
    pub fn remaining(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(truncated());
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(Error::codec(format!("invalid boolean byte {}", n))),
        }
    }

    pub fn read_pubkey(&mut self) -> Result<PublicKey, Error> {
        let b = self.read_bytes(PUBKEY_SIZE)?;
        PublicKey::from_slice(b).map_err(|e| Error::codec(format!("invalid public key: {}", e)))
    }

    pub fn read_block_hash(&mut self) -> Result<BlockHash, Error> {
        let b = self.read_bytes(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(BlockHash::from_byte_array(arr))
    }

    pub fn read_outpoint(&mut self) -> Result<OutPoint, Error> {
        let b = self.read_bytes(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        let txid = Txid::from_byte_array(arr);
        let vout = self.read_u32()?;
        Ok(OutPoint { txid, vout })
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_addrs(&mut self) -> Result<Vec<SocketAddr>, Error> {
        let count = self.read_u16()?;
        let mut addrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addrs.push(self.read_addr()?);
        }
        Ok(addrs)
    }

    fn read_addr(&mut self) -> Result<SocketAddr, Error> {
        match self.read_u8()? {
            ADDR_TYPE_IPV4 => {
                let b = self.read_bytes(4)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = self.read_u16()?;
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            ADDR_TYPE_IPV6 => {
                let b = self.read_bytes(16)?;
                let mut arr = [0u8; 16];
                arr.copy_from_slice(b);
                let port = self.read_u16()?;
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(arr)), port))
            }
            n => Err(Error::codec(format!("unknown address type {}", n))),
        }
    }
}

/// An append-only record writer.
#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_pubkey(&mut self, key: &PublicKey) {
        self.buf.extend_from_slice(&key.serialize());
    }

    pub fn write_block_hash(&mut self, hash: &BlockHash) {
        self.buf.extend_from_slice(&hash.to_byte_array());
    }

    pub fn write_outpoint(&mut self, op: &OutPoint) {
        self.buf.extend_from_slice(&op.txid.to_byte_array());
        self.write_u32(op.vout);
    }

    pub fn write_var_bytes(&mut self, b: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(b.len())
            .map_err(|_| Error::codec("variable length field too long"))?;
        self.write_u16(len);
        self.write_bytes(b);
        Ok(())
    }

    pub fn write_addrs(&mut self, addrs: &[SocketAddr]) -> Result<(), Error> {
        let count = u16::try_from(addrs.len())
            .map_err(|_| Error::codec("too many addresses"))?;
        self.write_u16(count);
        for addr in addrs {
            self.write_addr(addr);
        }
        Ok(())
    }

    fn write_addr(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.write_u8(ADDR_TYPE_IPV4);
                self.write_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.write_u8(ADDR_TYPE_IPV6);
                self.write_bytes(&ip.octets());
            }
        }
        self.write_u16(addr.port());
    }
}

/// The 36-byte key form of an outpoint.
pub(crate) fn outpoint_key(op: &OutPoint) -> [u8; OUTPOINT_SIZE] {
    let mut key = [0u8; OUTPOINT_SIZE];
    key[..32].copy_from_slice(&op.txid.to_byte_array());
    key[32..].copy_from_slice(&op.vout.to_be_bytes());
    key
}

/// Decode a 36-byte outpoint key.
pub(crate) fn outpoint_from_key(key: &[u8]) -> Result<OutPoint, Error> {
    let mut r = Reader::new(key);
    let op = r.read_outpoint()?;
    if !r.is_empty() {
        return Err(Error::codec("trailing bytes after outpoint"));
    }
    Ok(op)
}
