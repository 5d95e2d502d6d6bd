//! Message construction.
//!
//! The builder is a reusable scratch: a type-string buffer and a data buffer
//! that grow as needed and are recycled across messages. It is deliberately
//! non-reentrant — finish one message before starting the next. The ensemble
//! owns one builder; standalone use is fine for tests and companion threads.

use crate::args::{Arg, VecArg};
use crate::error::{Error, Result};
use crate::key::padded_len;
use crate::message::{Msg, MsgData};

#[derive(Debug, Default)]
pub struct MsgBuilder {
    types: Vec<u8>,
    data: Vec<u8>,
    is_bundle: bool,
    is_normal: bool,
}

impl MsgBuilder {
    pub fn new() -> MsgBuilder {
        MsgBuilder::default()
    }

    /// Reset the scratch and begin a new message.
    pub fn start(&mut self) {
        self.types.clear();
        self.data.clear();
        self.is_bundle = false;
        self.is_normal = false;
        self.types.push(b',');
    }

    fn arg_mode(&mut self) -> Result<()> {
        if self.is_bundle {
            return Err(Error::BuilderMisuse);
        }
        self.is_normal = true;
        Ok(())
    }

    pub fn add_i32(&mut self, v: i32) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'i');
        self.data.extend_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    pub fn add_i64(&mut self, v: i64) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'h');
        self.data.extend_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    pub fn add_f32(&mut self, v: f32) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'f');
        self.data.extend_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    pub fn add_f64(&mut self, v: f64) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'd');
        self.data.extend_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    pub fn add_time(&mut self, v: f64) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b't');
        self.data.extend_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    /// Characters are carried as int32 code points.
    pub fn add_char(&mut self, c: char) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'c');
        self.data.extend_from_slice(&(c as i32).to_ne_bytes());
        Ok(())
    }

    pub fn add_bool(&mut self, v: bool) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'B');
        self.data.extend_from_slice(&(v as i32).to_ne_bytes());
        Ok(())
    }

    pub fn add_true(&mut self) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'T');
        Ok(())
    }

    pub fn add_false(&mut self) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'F');
        Ok(())
    }

    pub fn add_nil(&mut self) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'N');
        Ok(())
    }

    pub fn add_infinitum(&mut self) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'I');
        Ok(())
    }

    pub fn add_midi(&mut self, m: u32) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'm');
        self.data.extend_from_slice(&(m as i32).to_ne_bytes());
        Ok(())
    }

    fn add_padded_str(&mut self, code: u8, s: &str) -> Result<()> {
        self.arg_mode()?;
        self.types.push(code);
        let start = self.data.len();
        // zero the word holding the padding before the copy so trailing
        // bytes are defined
        self.data.resize(start + padded_len(s), 0);
        self.data[start..start + s.len()].copy_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn add_str(&mut self, s: &str) -> Result<()> {
        self.add_padded_str(b's', s)
    }

    pub fn add_symbol(&mut self, s: &str) -> Result<()> {
        self.add_padded_str(b'S', s)
    }

    pub fn add_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'b');
        self.data.extend_from_slice(&(bytes.len() as i32).to_ne_bytes());
        let start = self.data.len();
        self.data.resize(start + ((bytes.len() + 3) & !3), 0);
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn add_array_start(&mut self) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'[');
        Ok(())
    }

    pub fn add_array_end(&mut self) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b']');
        Ok(())
    }

    /// Vectors carry a byte length, the element type character, then raw
    /// elements.
    pub fn add_vector(&mut self, v: &VecArg) -> Result<()> {
        self.arg_mode()?;
        self.types.push(b'v');
        match v {
            VecArg::Int32(xs) => {
                self.types.push(b'i');
                self.data
                    .extend_from_slice(&((xs.len() * 4) as i32).to_ne_bytes());
                for x in xs {
                    self.data.extend_from_slice(&x.to_ne_bytes());
                }
            }
            VecArg::Int64(xs) => {
                self.types.push(b'h');
                self.data
                    .extend_from_slice(&((xs.len() * 8) as i32).to_ne_bytes());
                for x in xs {
                    self.data.extend_from_slice(&x.to_ne_bytes());
                }
            }
            VecArg::Float(xs) => {
                self.types.push(b'f');
                self.data
                    .extend_from_slice(&((xs.len() * 4) as i32).to_ne_bytes());
                for x in xs {
                    self.data.extend_from_slice(&x.to_ne_bytes());
                }
            }
            VecArg::Double(xs) => {
                self.types.push(b'd');
                self.data
                    .extend_from_slice(&((xs.len() * 8) as i32).to_ne_bytes());
                for x in xs {
                    self.data.extend_from_slice(&x.to_ne_bytes());
                }
            }
        }
        Ok(())
    }

    pub fn add_arg(&mut self, arg: &Arg) -> Result<()> {
        match arg {
            Arg::Int32(v) => self.add_i32(*v),
            Arg::Int64(v) => self.add_i64(*v),
            Arg::Float(v) => self.add_f32(*v),
            Arg::Double(v) => self.add_f64(*v),
            Arg::Time(v) => self.add_time(*v),
            Arg::Str(s) => self.add_str(s),
            Arg::Symbol(s) => self.add_symbol(s),
            Arg::Char(c) => self.add_char(*c),
            Arg::Blob(b) => self.add_blob(b),
            Arg::Midi(m) => self.add_midi(*m),
            Arg::Bool(b) => self.add_bool(*b),
            Arg::True => self.add_true(),
            Arg::False => self.add_false(),
            Arg::Nil => self.add_nil(),
            Arg::Infinitum => self.add_infinitum(),
            Arg::ArrayStart => self.add_array_start(),
            Arg::ArrayEnd => self.add_array_end(),
            Arg::Vector(v) => self.add_vector(v),
        }
    }

    /// Append a complete message as a bundle element. Mutually exclusive
    /// with argument appends within one message.
    pub fn add_message(&mut self, msg: &Msg) -> Result<()> {
        if self.is_normal {
            return Err(Error::BuilderMisuse);
        }
        self.is_bundle = true;
        let body = msg.data.as_bytes();
        self.data
            .extend_from_slice(&(body.len() as u32).to_ne_bytes());
        self.data.extend_from_slice(body);
        Ok(())
    }

    /// Pack the accumulated arguments into a message addressed by `address`.
    pub fn finish(&mut self, time: f64, address: &str, tcp: bool) -> Result<Msg> {
        self.finish_inner(time, None, address, tcp)
    }

    /// Pack with an explicit service prefix: the final address is
    /// `/{service}{address}` (or `#{service}` for a bundle shell).
    pub fn finish_service(
        &mut self,
        time: f64,
        service: &str,
        address: &str,
        tcp: bool,
    ) -> Result<Msg> {
        self.finish_inner(time, Some(service), address, tcp)
    }

    fn finish_inner(
        &mut self,
        time: f64,
        service: Option<&str>,
        address: &str,
        tcp: bool,
    ) -> Result<Msg> {
        if address.is_empty() && service.is_none() {
            return Err(Error::BadName);
        }
        let prefix = if self.is_bundle { b'#' } else { b'/' };
        let mut full = String::with_capacity(address.len() + 16);
        match service {
            Some(svc) => {
                full.push(prefix as char);
                full.push_str(svc);
                full.push_str(address);
            }
            None => {
                if self.is_bundle && !address.starts_with('#') {
                    full.push('#');
                    full.push_str(address.trim_start_matches(['/', '!']));
                } else {
                    full.push_str(address);
                }
            }
        }
        if !full.starts_with(['/', '!', '#']) {
            return Err(Error::BadName);
        }
        let addr_size = padded_len(&full);
        let types_size = if self.is_bundle {
            0
        } else {
            padded_len(std::str::from_utf8(&self.types).map_err(|_| Error::InvalidMsg)?)
        };
        let mut body = Vec::with_capacity(8 + addr_size + types_size + self.data.len());
        body.extend_from_slice(&time.to_ne_bytes());
        let a = body.len();
        body.resize(a + addr_size, 0);
        body[a..a + full.len()].copy_from_slice(full.as_bytes());
        if types_size > 0 {
            let t = body.len();
            body.resize(t + types_size, 0);
            body[t..t + self.types.len()].copy_from_slice(&self.types);
        }
        body.extend_from_slice(&self.data);
        self.start();
        Ok(Msg {
            tcp,
            data: MsgData::from_bytes(body),
        })
    }
}

impl Msg {
    /// Build a message from a slice of argument values.
    pub fn build(address: &str, time: f64, tcp: bool, args: &[Arg]) -> Result<Msg> {
        let mut b = MsgBuilder::new();
        b.start();
        for a in args {
            b.add_arg(a)?;
        }
        b.finish(time, address, tcp)
    }
}
