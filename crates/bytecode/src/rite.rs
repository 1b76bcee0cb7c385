//! Reading and writing the RITE binary container produced by the mruby
//! compiler.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::irep::{CatchHandler, CatchKind, Irep, PoolValue};

pub const RITE_IDENT: &[u8; 4] = b"RITE";
pub const RITE_MAJOR: &[u8; 2] = b"03";
pub const RITE_MINOR: &[u8; 2] = b"00";
pub const COMPILER_NAME: &[u8; 4] = b"GRNT";
pub const COMPILER_VERSION: &[u8; 4] = b"0000";

const HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 8;
const IREP_SECTION: &[u8; 4] = b"IREP";
const END_SECTION: &[u8; 4] = b"END\0";
const RITE_VERSION: &[u8; 4] = b"0300";
const NULL_SYM_LEN: u16 = 0xffff;
const CATCH_HANDLER_SIZE: usize = 13;

const TT_STR: u8 = 0;
const TT_INT32: u8 = 1;
const TT_SSTR: u8 = 2;
const TT_INT64: u8 = 3;
const TT_FLOAT: u8 = 5;
const TT_BIGINT: u8 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("not a RITE binary")]
    BadIdent,
    #[error("unsupported RITE version {major}.{minor}")]
    Version { major: String, minor: String },
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),
    #[error("binary declares {declared} bytes but {actual} were given")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("missing IREP section")]
    MissingIrep,
    #[error("unknown literal pool tag {0}")]
    PoolTag(u8),
    #[error("bignum literals are not supported")]
    BigInt,
    #[error("unknown catch handler kind {0}")]
    CatchKind(u8),
    #[error("catch handler #{index} lies outside its instruction sequence")]
    CatchHandler { index: usize },
    #[error("invalid instruction at {pc:03}: {reason}")]
    Instruction { pc: usize, reason: &'static str },
}

type Result<T> = std::result::Result<T, LoadError>;

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &'static str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(LoadError::Truncated(what));
        }
        Ok(())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

/// Parse a RITE binary and validate every instruction sequence in it.
pub fn load(bin: &[u8]) -> Result<Arc<Irep>> {
    let mut r = Reader { buf: bin };
    let ident = r.bytes(4, "header")?;
    if ident != RITE_IDENT {
        return Err(LoadError::BadIdent);
    }
    let major = r.bytes(2, "header")?;
    let minor = r.bytes(2, "header")?;
    if major != RITE_MAJOR || minor > &RITE_MINOR[..] {
        return Err(LoadError::Version {
            major: String::from_utf8_lossy(major).into_owned(),
            minor: String::from_utf8_lossy(minor).into_owned(),
        });
    }
    let declared = r.u32("header")? as usize;
    if declared > bin.len() {
        return Err(LoadError::SizeMismatch {
            declared,
            actual: bin.len(),
        });
    }
    r.bytes(8, "header")?;
    let mut r = Reader {
        buf: &bin[HEADER_SIZE..declared.max(HEADER_SIZE)],
    };

    let mut irep = None;
    while r.buf.has_remaining() {
        let ident = r.bytes(4, "section header")?;
        let size = r.u32("section header")? as usize;
        let body_len = size
            .checked_sub(SECTION_HEADER_SIZE)
            .ok_or(LoadError::Truncated("section header"))?;
        let body = r.bytes(body_len, "section")?;
        match ident {
            _ if ident == IREP_SECTION => {
                let mut body = Reader { buf: body };
                body.bytes(4, "rite version")?;
                irep = Some(read_irep(&mut body)?);
            }
            _ if ident == END_SECTION => break,
            // LVAR and DBG sections carry no semantics
            _ => tracing::trace!(section = ?String::from_utf8_lossy(ident), "skipping section"),
        }
    }
    let irep = irep.ok_or(LoadError::MissingIrep)?;
    irep.validate()?;
    tracing::debug!(units = irep.unit_count(), "loaded RITE binary");
    Ok(irep)
}

fn read_irep(r: &mut Reader<'_>) -> Result<Arc<Irep>> {
    r.u32("irep record size")?;
    let nlocals = r.u16("irep header")?;
    let nregs = r.u16("irep header")?;
    let rlen = r.u16("irep header")? as usize;
    let clen = r.u16("irep header")? as usize;
    let ilen = r.u32("irep header")? as usize;
    let iseq = Bytes::copy_from_slice(r.bytes(ilen, "instruction sequence")?);

    let mut catch_handlers = Vec::with_capacity(clen);
    let mut table = Reader {
        buf: r.bytes(clen * CATCH_HANDLER_SIZE, "catch handlers")?,
    };
    for _ in 0..clen {
        let kind = match table.u8("catch handler")? {
            0 => CatchKind::Rescue,
            1 => CatchKind::Ensure,
            k => return Err(LoadError::CatchKind(k)),
        };
        catch_handlers.push(CatchHandler {
            kind,
            begin: table.u32("catch handler")?,
            end: table.u32("catch handler")?,
            target: table.u32("catch handler")?,
        });
    }

    let plen = r.u16("pool")? as usize;
    let mut pool = Vec::with_capacity(plen);
    for _ in 0..plen {
        let value = match r.u8("pool")? {
            TT_STR | TT_SSTR => {
                let len = r.u16("pool string")? as usize;
                let s = Bytes::copy_from_slice(r.bytes(len, "pool string")?);
                r.u8("pool string")?;
                PoolValue::Str(s)
            }
            TT_INT32 => PoolValue::Int(r.u32("pool integer")? as i32 as i64),
            TT_INT64 => {
                let hi = r.u32("pool integer")? as u64;
                let lo = r.u32("pool integer")? as u64;
                PoolValue::Int((hi << 32 | lo) as i64)
            }
            TT_FLOAT => {
                // floats are dumped in little endian
                let mut raw = r.bytes(8, "pool float")?;
                PoolValue::Float(raw.get_f64_le())
            }
            TT_BIGINT => return Err(LoadError::BigInt),
            tag => return Err(LoadError::PoolTag(tag)),
        };
        pool.push(value);
    }

    let slen = r.u16("symbols")? as usize;
    let mut syms = Vec::with_capacity(slen);
    for _ in 0..slen {
        let len = r.u16("symbol")?;
        if len == NULL_SYM_LEN {
            syms.push(None);
            continue;
        }
        let name = Bytes::copy_from_slice(r.bytes(len as usize, "symbol")?);
        r.u8("symbol")?;
        syms.push(Some(name));
    }

    let reps = (0..rlen)
        .map(|_| read_irep(r))
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(Irep {
        nlocals,
        nregs,
        iseq,
        catch_handlers,
        pool,
        syms,
        reps,
    }))
}

/// Serialize a code unit tree into a RITE binary.
pub fn dump(irep: &Irep) -> Vec<u8> {
    let mut section = Vec::new();
    write_irep(irep, &mut section);

    let irep_section_size = SECTION_HEADER_SIZE + RITE_VERSION.len() + section.len();
    let total = HEADER_SIZE + irep_section_size + SECTION_HEADER_SIZE;
    let mut out = Vec::with_capacity(total);
    out.put_slice(RITE_IDENT);
    out.put_slice(RITE_MAJOR);
    out.put_slice(RITE_MINOR);
    out.put_u32(total as u32);
    out.put_slice(COMPILER_NAME);
    out.put_slice(COMPILER_VERSION);

    out.put_slice(IREP_SECTION);
    out.put_u32(irep_section_size as u32);
    out.put_slice(RITE_VERSION);
    out.put_slice(&section);

    out.put_slice(END_SECTION);
    out.put_u32(SECTION_HEADER_SIZE as u32);
    out
}

fn write_irep(irep: &Irep, out: &mut Vec<u8>) {
    let start = out.len();
    out.put_u32(0);
    out.put_u16(irep.nlocals);
    out.put_u16(irep.nregs);
    out.put_u16(irep.reps.len() as u16);
    out.put_u16(irep.catch_handlers.len() as u16);
    out.put_u32(irep.iseq.len() as u32);
    out.put_slice(&irep.iseq);
    for h in &irep.catch_handlers {
        out.put_u8(h.kind as u8);
        out.put_u32(h.begin);
        out.put_u32(h.end);
        out.put_u32(h.target);
    }

    out.put_u16(irep.pool.len() as u16);
    for value in &irep.pool {
        match value {
            PoolValue::Str(s) => {
                out.put_u8(TT_STR);
                out.put_u16(s.len() as u16);
                out.put_slice(s);
                out.put_u8(0);
            }
            PoolValue::Int(i) => match i32::try_from(*i) {
                Ok(small) => {
                    out.put_u8(TT_INT32);
                    out.put_i32(small);
                }
                Err(_) => {
                    out.put_u8(TT_INT64);
                    out.put_i64(*i);
                }
            },
            PoolValue::Float(f) => {
                out.put_u8(TT_FLOAT);
                out.put_f64_le(*f);
            }
        }
    }

    out.put_u16(irep.syms.len() as u16);
    for sym in &irep.syms {
        match sym {
            Some(name) => {
                out.put_u16(name.len() as u16);
                out.put_slice(name);
                out.put_u8(0);
            }
            None => out.put_u16(NULL_SYM_LEN),
        }
    }

    let record_size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&record_size.to_be_bytes());

    for child in &irep.reps {
        write_irep(child, out);
    }
}
