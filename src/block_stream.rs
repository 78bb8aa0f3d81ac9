//! Integrity-checked block framing for the encrypted payload
//!
//! KDBX 4 authenticates each block of ciphertext with HMAC-SHA256, KDBX 3
//! hashes each block of plaintext with SHA-256 before encryption.

use std::cmp;
use std::collections::VecDeque;
use std::io::{self, prelude::*};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use ring::digest::{digest, Context, SHA256, SHA512};
use ring::hmac;

use crate::error::Error;

pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Read `len` bytes, growing the buffer only as data arrives
pub(crate) fn read_len<R: Read>(input: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    input.take(u64::from(len)).read_to_end(&mut data)?;
    if data.len() != len as usize {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(data)
}

/// HMAC key for the block with the given index, `u64::MAX` being the header
pub(crate) fn block_hmac_key(index: u64, hmac_key_base: &[u8]) -> hmac::Key {
    let mut context = Context::new(&SHA512);
    context.update(&index.to_le_bytes());
    context.update(hmac_key_base);
    hmac::Key::new(hmac::HMAC_SHA256, context.finish().as_ref())
}

fn block_message(index: u64, block: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(block.len() + 12);
    message.extend(&index.to_le_bytes());
    message.extend(&(block.len() as u32).to_le_bytes());
    message.extend(block);
    message
}

pub struct BlockReader<R: Read> {
    index: u64,
    hmac_key_base: Vec<u8>,
    input: R,
    buf: VecDeque<u8>,
    complete: bool,
}

impl<R: Read> BlockReader<R> {
    pub fn new(key: &[u8], input: R) -> Self {
        Self {
            index: 0,
            hmac_key_base: key.to_owned(),
            input,
            buf: VecDeque::new(),
            complete: false,
        }
    }

    fn load_next_block(&mut self) -> io::Result<()> {
        debug!("Block {}", self.index);
        let mut hmac_tag: [u8; 32] = [0; 32];
        self.input.read_exact(&mut hmac_tag)?;
        let block_size = self.input.read_u32::<LittleEndian>()?;
        let block = read_len(&mut self.input, block_size)?;

        let hmac_key = block_hmac_key(self.index, &self.hmac_key_base);
        hmac::verify(&hmac_key, &block_message(self.index, &block), &hmac_tag)
            .map_err(|_| Error::BlockHmacMismatch { index: self.index }.into_io())?;
        self.index += 1;
        if block_size == 0 {
            self.complete = true;
        }
        self.buf = block.into();
        Ok(())
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buf.is_empty() {
            if self.complete {
                return Ok(0);
            }
            self.load_next_block()?;
        }
        let count = cmp::min(buf.len(), self.buf.len());
        for (dst, src) in buf.iter_mut().zip(self.buf.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }
}

pub struct BlockWriter<W: Write> {
    index: u64,
    block_size: usize,
    hmac_key_base: Vec<u8>,
    output: W,
    buf: Vec<u8>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(key: &[u8], output: W) -> Self {
        Self::with_block_size(key, output, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(key: &[u8], output: W, block_size: usize) -> Self {
        Self {
            index: 0,
            block_size,
            hmac_key_base: key.to_owned(),
            output,
            buf: Vec::new(),
        }
    }

    fn write_block(&mut self) -> io::Result<()> {
        debug!("Block {} ({} bytes)", self.index, self.buf.len());
        let hmac_key = block_hmac_key(self.index, &self.hmac_key_base);
        let hmac_tag = hmac::sign(&hmac_key, &block_message(self.index, &self.buf));
        self.output.write_all(hmac_tag.as_ref())?;
        self.output.write_u32::<LittleEndian>(self.buf.len() as u32)?;
        self.output.write_all(&self.buf)?;
        self.buf.clear();
        self.index += 1;
        Ok(())
    }

    /// Write any pending data and the terminating empty block
    pub fn finish(mut self) -> io::Result<W> {
        if !self.buf.is_empty() {
            self.write_block()?;
        }
        self.write_block()?;
        self.output.flush()?;
        Ok(self.output)
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = cmp::min(self.block_size - self.buf.len(), buf.len());
        self.buf.extend(&buf[..remaining]);
        if self.buf.len() >= self.block_size {
            self.write_block()?;
        }
        Ok(remaining)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// KDBX 3 hashed block stream reader
pub struct HashedBlockReader<R: Read> {
    index: u32,
    input: R,
    buf: VecDeque<u8>,
    complete: bool,
}

impl<R: Read> HashedBlockReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            index: 0,
            input,
            buf: VecDeque::new(),
            complete: false,
        }
    }

    fn load_next_block(&mut self) -> io::Result<()> {
        debug!("Hashed block {}", self.index);
        let block_id = self.input.read_u32::<LittleEndian>()?;
        if block_id != self.index {
            return Err(Error::BlockHashMismatch {
                index: self.index as u64,
            }
            .into_io());
        }
        let mut block_hash_expected = [0; 32];
        self.input.read_exact(&mut block_hash_expected)?;
        let block_size = self.input.read_u32::<LittleEndian>()?;
        if block_size == 0 {
            if block_hash_expected.iter().any(|b| *b != 0) {
                return Err(Error::BlockHashMismatch {
                    index: self.index as u64,
                }
                .into_io());
            }
            self.complete = true;
            return Ok(());
        }
        let block = read_len(&mut self.input, block_size)?;
        if digest(&SHA256, &block).as_ref() != block_hash_expected {
            return Err(Error::BlockHashMismatch {
                index: self.index as u64,
            }
            .into_io());
        }
        self.index += 1;
        self.buf = block.into();
        Ok(())
    }
}

impl<R: Read> Read for HashedBlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buf.is_empty() {
            if self.complete {
                return Ok(0);
            }
            self.load_next_block()?;
        }
        let count = cmp::min(buf.len(), self.buf.len());
        for (dst, src) in buf.iter_mut().zip(self.buf.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }
}

/// KDBX 3 hashed block stream writer
pub struct HashedBlockWriter<W: Write> {
    index: u32,
    block_size: usize,
    output: W,
    buf: Vec<u8>,
}

impl<W: Write> HashedBlockWriter<W> {
    pub fn new(output: W) -> Self {
        Self::with_block_size(output, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(output: W, block_size: usize) -> Self {
        Self {
            index: 0,
            block_size,
            output,
            buf: Vec::new(),
        }
    }

    fn write_block(&mut self) -> io::Result<()> {
        self.output.write_u32::<LittleEndian>(self.index)?;
        if self.buf.is_empty() {
            self.output.write_all(&[0; 32])?;
        } else {
            self.output.write_all(digest(&SHA256, &self.buf).as_ref())?;
        }
        self.output.write_u32::<LittleEndian>(self.buf.len() as u32)?;
        self.output.write_all(&self.buf)?;
        self.buf.clear();
        self.index += 1;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        if !self.buf.is_empty() {
            self.write_block()?;
        }
        self.write_block()?;
        self.output.flush()?;
        Ok(self.output)
    }
}

impl<W: Write> Write for HashedBlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = cmp::min(self.block_size - self.buf.len(), buf.len());
        self.buf.extend(&buf[..remaining]);
        if self.buf.len() >= self.block_size {
            self.write_block()?;
        }
        Ok(remaining)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}
