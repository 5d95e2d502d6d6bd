//! Argument extraction.
//!
//! A reader walks a message's type string and data region in step,
//! producing owned [`Arg`] values. Numeric arguments coerce freely among
//! int32, int64, float, double/time, and bool; `T`/`F` accept any non-zero
//! (zero) numeric. Vectors extract as arrays and arrays as vectors, with
//! per-element coercion. Once a bounds violation or type mismatch occurs,
//! every subsequent call fails.
//!
//! When a whole array is requested as a vector (`get_next('v')` against
//! `[...]`), elements are coerced to the type of the first array element
//! (`d` when the array is empty).

use crate::error::{Error, Result};
use crate::message::MsgData;

/// One extracted argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Time(f64),
    Str(String),
    Symbol(String),
    Char(char),
    Blob(Vec<u8>),
    Midi(u32),
    Bool(bool),
    True,
    False,
    Nil,
    Infinitum,
    ArrayStart,
    ArrayEnd,
    Vector(VecArg),
}

/// Homogeneous vector payload.
#[derive(Debug, Clone, PartialEq)]
pub enum VecArg {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl VecArg {
    pub fn len(&self) -> usize {
        match self {
            VecArg::Int32(v) => v.len(),
            VecArg::Int64(v) => v.len(),
            VecArg::Float(v) => v.len(),
            VecArg::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elem_type(&self) -> char {
        match self {
            VecArg::Int32(_) => 'i',
            VecArg::Int64(_) => 'h',
            VecArg::Float(_) => 'f',
            VecArg::Double(_) => 'd',
        }
    }
}

pub struct ArgReader<'m> {
    types: &'m [u8],
    ti: usize,
    data: &'m [u8],
    di: usize,
    /// When extracting a vector as array elements: (element type, bytes left).
    vec_as_array: Option<(u8, usize)>,
    failed: bool,
}

impl<'m> ArgReader<'m> {
    pub fn new(msg: &'m MsgData) -> ArgReader<'m> {
        ArgReader {
            types: msg.types().as_bytes(),
            ti: 0,
            data: msg.args_bytes(),
            di: 0,
            vec_as_array: None,
            failed: false,
        }
    }

    /// Type characters not yet consumed.
    pub fn types_remaining(&self) -> &str {
        std::str::from_utf8(&self.types[self.ti.min(self.types.len())..]).unwrap_or("")
    }

    fn fail(&mut self, e: Error) -> Error {
        self.failed = true;
        e
    }

    fn rd_bytes(&mut self, n: usize) -> Result<&'m [u8]> {
        if self.di + n > self.data.len() {
            return Err(self.fail(Error::InvalidMsg));
        }
        let s = &self.data[self.di..self.di + n];
        self.di += n;
        Ok(s)
    }

    fn rd_i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.rd_bytes(4)?.try_into().unwrap()))
    }

    fn rd_i64(&mut self) -> Result<i64> {
        Ok(i64::from_ne_bytes(self.rd_bytes(8)?.try_into().unwrap()))
    }

    fn rd_f32(&mut self) -> Result<f32> {
        Ok(f32::from_ne_bytes(self.rd_bytes(4)?.try_into().unwrap()))
    }

    fn rd_f64(&mut self) -> Result<f64> {
        Ok(f64::from_ne_bytes(self.rd_bytes(8)?.try_into().unwrap()))
    }

    fn rd_string(&mut self) -> Result<&'m str> {
        let rel = self.data[self.di..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::InvalidMsg)
            .map_err(|e| self.fail(e))?;
        let padded = (rel + 4) & !3;
        if self.di + padded > self.data.len() {
            return Err(self.fail(Error::InvalidMsg));
        }
        let s = std::str::from_utf8(&self.data[self.di..self.di + rel])
            .map_err(|_| self.fail(Error::InvalidMsg))?;
        self.di += padded;
        Ok(s)
    }

    /// Extract the next argument, coercing to `want` where compatible.
    pub fn get_next(&mut self, want: char) -> Result<Arg> {
        if self.failed {
            return Err(Error::InvalidMsg);
        }
        if let Some((elem, remaining)) = self.vec_as_array {
            return self.next_vector_element(want, elem, remaining);
        }
        let actual = match self.types.get(self.ti) {
            Some(&t) => t,
            None => return Err(self.fail(Error::TypeMismatch)),
        };
        self.ti += 1;
        match actual {
            b'i' => {
                let v = self.rd_i32()?;
                if want == 'i' {
                    Ok(Arg::Int32(v))
                } else {
                    self.coerce_int(want, v as i64)
                }
            }
            b'h' => {
                let v = self.rd_i64()?;
                if want == 'h' {
                    Ok(Arg::Int64(v))
                } else {
                    self.coerce_int(want, v)
                }
            }
            b'f' => {
                let v = self.rd_f32()?;
                if want == 'f' {
                    Ok(Arg::Float(v))
                } else {
                    self.coerce_float(want, v as f64)
                }
            }
            b'd' | b't' => {
                let v = self.rd_f64()?;
                match want {
                    'd' => Ok(Arg::Double(v)),
                    't' => Ok(Arg::Time(v)),
                    _ => self.coerce_float(want, v),
                }
            }
            b'B' => {
                let v = self.rd_i32()?;
                if want == 'B' {
                    Ok(Arg::Bool(v != 0))
                } else {
                    self.coerce_int(want, v as i64)
                }
            }
            b'T' => self.coerce_int(want, 1),
            b'F' => self.coerce_int(want, 0),
            b's' | b'S' => {
                let s = self.rd_string()?;
                match want {
                    's' => Ok(Arg::Str(s.to_owned())),
                    'S' => Ok(Arg::Symbol(s.to_owned())),
                    _ => Err(self.fail(Error::TypeMismatch)),
                }
            }
            b'c' => {
                let v = self.rd_i32()?;
                if want != 'c' {
                    return Err(self.fail(Error::TypeMismatch));
                }
                char::from_u32(v as u32)
                    .map(Arg::Char)
                    .ok_or_else(|| self.fail(Error::InvalidMsg))
            }
            b'm' => {
                let v = self.rd_i32()?;
                if want != 'm' {
                    return Err(self.fail(Error::TypeMismatch));
                }
                Ok(Arg::Midi(v as u32))
            }
            b'b' => {
                let len = self.rd_i32()? as usize;
                let padded = (len + 3) & !3;
                let raw = self.rd_bytes(padded)?;
                if want != 'b' {
                    return Err(self.fail(Error::TypeMismatch));
                }
                Ok(Arg::Blob(raw[..len].to_vec()))
            }
            b'N' => {
                if want != 'N' {
                    return Err(self.fail(Error::TypeMismatch));
                }
                Ok(Arg::Nil)
            }
            b'I' => {
                if want != 'I' {
                    return Err(self.fail(Error::TypeMismatch));
                }
                Ok(Arg::Infinitum)
            }
            b'[' => match want {
                '[' => Ok(Arg::ArrayStart),
                'v' => self.array_to_vector(),
                _ => Err(self.fail(Error::TypeMismatch)),
            },
            b']' => {
                if want != ']' {
                    return Err(self.fail(Error::TypeMismatch));
                }
                Ok(Arg::ArrayEnd)
            }
            b'v' => {
                let elem = match self.types.get(self.ti) {
                    Some(&t) => t,
                    None => return Err(self.fail(Error::InvalidMsg)),
                };
                self.ti += 1;
                let bytes = self.rd_i32()? as usize;
                match want {
                    'v' => self.read_vector(elem, bytes, elem),
                    '[' => {
                        self.vec_as_array = Some((elem, bytes));
                        Ok(Arg::ArrayStart)
                    }
                    _ => Err(self.fail(Error::TypeMismatch)),
                }
            }
            _ => Err(self.fail(Error::InvalidMsg)),
        }
    }

    /// Extract the next argument as a vector with the given element type,
    /// transcoding from an array if necessary.
    pub fn get_vector(&mut self, elem: char) -> Result<VecArg> {
        if self.failed {
            return Err(Error::InvalidMsg);
        }
        let actual = match self.types.get(self.ti) {
            Some(&t) => t,
            None => return Err(self.fail(Error::TypeMismatch)),
        };
        match actual {
            b'v' => {
                self.ti += 1;
                let src = match self.types.get(self.ti) {
                    Some(&t) => t,
                    None => return Err(self.fail(Error::InvalidMsg)),
                };
                self.ti += 1;
                let bytes = self.rd_i32()? as usize;
                match self.read_vector(src, bytes, elem as u8)? {
                    Arg::Vector(v) => Ok(v),
                    _ => unreachable!(),
                }
            }
            b'[' => {
                self.ti += 1;
                match self.collect_array_vector(elem as u8)? {
                    Arg::Vector(v) => Ok(v),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.fail(Error::TypeMismatch)),
        }
    }

    fn read_vector(&mut self, src: u8, bytes: usize, dst: u8) -> Result<Arg> {
        if self.di + bytes > self.data.len() {
            return Err(self.fail(Error::InvalidMsg));
        }
        let count = match src {
            b'i' | b'f' => bytes / 4,
            b'h' | b'd' => bytes / 8,
            _ => return Err(self.fail(Error::InvalidMsg)),
        };
        let mut acc = VecAccum::new(dst).ok_or(Error::TypeMismatch).map_err(|e| self.fail(e))?;
        for _ in 0..count {
            let v = self.read_elem_as_f64_or_i64(src)?;
            acc.push(v);
        }
        Ok(Arg::Vector(acc.finish()))
    }

    fn array_to_vector(&mut self) -> Result<Arg> {
        // element type of the first entry decides the vector type
        let dst = match self.types.get(self.ti) {
            Some(&b']') | None => b'd',
            Some(&t) => t,
        };
        self.collect_array_vector(dst)
    }

    fn collect_array_vector(&mut self, dst: u8) -> Result<Arg> {
        let mut acc = VecAccum::new(dst).ok_or(Error::TypeMismatch).map_err(|e| self.fail(e))?;
        loop {
            let t = match self.types.get(self.ti) {
                Some(&t) => t,
                None => return Err(self.fail(Error::InvalidMsg)),
            };
            self.ti += 1;
            if t == b']' {
                return Ok(Arg::Vector(acc.finish()));
            }
            let v = self.read_elem_as_f64_or_i64(t)?;
            acc.push(v);
        }
    }

    fn next_vector_element(&mut self, want: char, elem: u8, remaining: usize) -> Result<Arg> {
        if want == ']' {
            if remaining != 0 {
                return Err(self.fail(Error::TypeMismatch));
            }
            self.vec_as_array = None;
            return Ok(Arg::ArrayEnd);
        }
        let size = if elem == b'h' || elem == b'd' { 8 } else { 4 };
        if remaining < size {
            return Err(self.fail(Error::InvalidMsg));
        }
        self.vec_as_array = Some((elem, remaining - size));
        let v = self.read_elem_as_f64_or_i64(elem)?;
        match (elem, want) {
            (b'i', 'i') => Ok(Arg::Int32(as_i64(v) as i32)),
            (b'h', 'h') => Ok(Arg::Int64(as_i64(v))),
            (b'f', 'f') => Ok(Arg::Float(as_f64(v) as f32)),
            (b'd', 'd') => Ok(Arg::Double(as_f64(v))),
            _ => match v {
                Num::I(i) => self.coerce_int(want, i),
                Num::F(f) => self.coerce_float(want, f),
            },
        }
    }

    fn read_elem_as_f64_or_i64(&mut self, t: u8) -> Result<Num> {
        match t {
            b'i' => Ok(Num::I(self.rd_i32()? as i64)),
            b'h' => Ok(Num::I(self.rd_i64()?)),
            b'f' => Ok(Num::F(self.rd_f32()? as f64)),
            b'd' | b't' => Ok(Num::F(self.rd_f64()?)),
            _ => Err(self.fail(Error::TypeMismatch)),
        }
    }

    fn coerce_int(&mut self, want: char, v: i64) -> Result<Arg> {
        match want {
            'i' => Ok(Arg::Int32(v as i32)),
            'h' => Ok(Arg::Int64(v)),
            'f' => Ok(Arg::Float(v as f32)),
            'd' => Ok(Arg::Double(v as f64)),
            't' => Ok(Arg::Time(v as f64)),
            'B' => Ok(Arg::Bool(v != 0)),
            'T' if v != 0 => Ok(Arg::True),
            'F' if v == 0 => Ok(Arg::False),
            _ => Err(self.fail(Error::TypeMismatch)),
        }
    }

    fn coerce_float(&mut self, want: char, v: f64) -> Result<Arg> {
        match want {
            'i' => Ok(Arg::Int32(v as i32)),
            'h' => Ok(Arg::Int64(v as i64)),
            'f' => Ok(Arg::Float(v as f32)),
            'd' => Ok(Arg::Double(v)),
            't' => Ok(Arg::Time(v)),
            'B' => Ok(Arg::Bool(v != 0.0)),
            'T' if v != 0.0 => Ok(Arg::True),
            'F' if v == 0.0 => Ok(Arg::False),
            _ => Err(self.fail(Error::TypeMismatch)),
        }
    }

    // Typed conveniences used by most handlers.

    pub fn get_i32(&mut self) -> Result<i32> {
        match self.get_next('i')? {
            Arg::Int32(v) => Ok(v),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        match self.get_next('h')? {
            Arg::Int64(v) => Ok(v),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        match self.get_next('f')? {
            Arg::Float(v) => Ok(v),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        match self.get_next('d')? {
            Arg::Double(v) => Ok(v),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_time(&mut self) -> Result<f64> {
        match self.get_next('t')? {
            Arg::Time(v) => Ok(v),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_str(&mut self) -> Result<String> {
        match self.get_next('s')? {
            Arg::Str(s) => Ok(s),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_next('B')? {
            Arg::Bool(b) => Ok(b),
            _ => Err(Error::TypeMismatch),
        }
    }

    pub fn get_blob(&mut self) -> Result<Vec<u8>> {
        match self.get_next('b')? {
            Arg::Blob(b) => Ok(b),
            _ => Err(Error::TypeMismatch),
        }
    }
}

enum Num {
    I(i64),
    F(f64),
}

fn as_i64(n: Num) -> i64 {
    match n {
        Num::I(i) => i,
        Num::F(f) => f as i64,
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::I(i) => i as f64,
        Num::F(f) => f,
    }
}

/// Accumulates coerced elements into the requested vector type.
struct VecAccum {
    out: VecArg,
}

impl VecAccum {
    fn new(dst: u8) -> Option<VecAccum> {
        let out = match dst {
            b'i' => VecArg::Int32(Vec::new()),
            b'h' => VecArg::Int64(Vec::new()),
            b'f' => VecArg::Float(Vec::new()),
            b'd' | b't' => VecArg::Double(Vec::new()),
            _ => return None,
        };
        Some(VecAccum { out })
    }

    fn push(&mut self, v: Num) {
        match &mut self.out {
            VecArg::Int32(xs) => xs.push(as_i64(v) as i32),
            VecArg::Int64(xs) => xs.push(as_i64(v)),
            VecArg::Float(xs) => xs.push(as_f64(v) as f32),
            VecArg::Double(xs) => xs.push(as_f64(v)),
        }
    }

    fn finish(self) -> VecArg {
        self.out
    }
}
