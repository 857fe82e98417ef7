//! Little-endian binary stream helpers shared by every model.
//!
//! A model record starts with `[i32 name_length][name bytes]`; layers append
//! their own state after it and containers append their children.

use std::io::{ErrorKind, Read, Write};

use crate::error::{Error, Result};
use crate::variables::Tensor;

pub fn write_name(w: &mut dyn Write, name: &str) -> Result<()> {
    let len = i32::try_from(name.len()).map_err(|_| Error::InvalidFormat {
        message: format!("name of {} bytes is too long", name.len()),
    })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    Ok(())
}

pub fn read_name(r: &mut dyn Read) -> Result<String> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = i32::from_le_bytes(len);
    if len < 0 {
        return Err(Error::InvalidFormat { message: format!("negative name length {len}") });
    }
    // grows with the bytes actually present
    let mut bytes = Vec::new();
    Read::take(&mut *r, len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
    }
    String::from_utf8(bytes)
        .map_err(|e| Error::InvalidFormat { message: format!("name is not UTF-8: {e}") })
}

pub fn write_u64(w: &mut dyn Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64(r: &mut dyn Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    r.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_bool(w: &mut dyn Write, value: bool) -> Result<()> {
    w.write_all(&[value as u8])?;
    Ok(())
}

pub fn read_bool(r: &mut dyn Read) -> Result<bool> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte)?;
    Ok(byte[0] != 0)
}

pub fn write_shape(w: &mut dyn Write, shape: &[usize]) -> Result<()> {
    write_u64(w, shape.len() as u64)?;
    for &dim in shape {
        write_u64(w, dim as u64)?;
    }
    Ok(())
}

pub fn read_shape(r: &mut dyn Read) -> Result<Vec<usize>> {
    let rank = read_u64(r)? as usize;
    (0..rank).map(|_| read_u64(r).map(|d| d as usize)).collect()
}

pub fn write_f32s(w: &mut dyn Write, values: &[f32]) -> Result<()> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_f32s(r: &mut dyn Read, values: &mut [f32]) -> Result<()> {
    let mut bytes = [0u8; 4];
    for v in values.iter_mut() {
        r.read_exact(&mut bytes)?;
        *v = f32::from_le_bytes(bytes);
    }
    Ok(())
}

pub fn write_tensor(w: &mut dyn Write, tensor: &Tensor) -> Result<()> {
    write_shape(w, tensor.shape())?;
    write_f32s(w, tensor.data())
}

/// Reads a tensor record into an already shaped tensor.
pub fn read_tensor(r: &mut dyn Read, tensor: &mut Tensor) -> Result<()> {
    let shape = read_shape(r)?;
    if shape != tensor.shape() {
        return Err(Error::InvalidFormat {
            message: format!("tensor shape {:?} does not match {:?}", shape, tensor.shape()),
        });
    }
    read_f32s(r, tensor.data_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_name_layout() {
        let mut bytes = Vec::new();
        write_name(&mut bytes, "lut0").unwrap();
        assert_eq!(bytes, vec![4, 0, 0, 0, b'l', b'u', b't', b'0']);
        assert_eq!(read_name(&mut Cursor::new(bytes)).unwrap(), "lut0");
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let bytes = (-1i32).to_le_bytes().to_vec();
        assert!(matches!(read_name(&mut Cursor::new(bytes)), Err(Error::InvalidFormat { .. })));
    }

    #[test]
    fn test_truncated_stream_is_io_error() {
        let bytes = vec![8, 0, 0, 0, b'x'];
        assert!(matches!(read_name(&mut Cursor::new(bytes)), Err(Error::Io(_))));
    }

    #[test]
    fn test_oversized_name_length_on_short_stream() {
        let mut bytes = i32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        match read_name(&mut Cursor::new(bytes)) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_name_read_leaves_following_bytes() {
        let mut bytes = Vec::new();
        write_name(&mut bytes, "bn").unwrap();
        write_bool(&mut bytes, true).unwrap();
        let mut cursor = Cursor::new(bytes);
        assert_eq!(read_name(&mut cursor).unwrap(), "bn");
        assert!(read_bool(&mut cursor).unwrap());
    }

    #[test]
    fn test_tensor_shape_is_checked() {
        let mut bytes = Vec::new();
        write_tensor(&mut bytes, &Tensor::from_vec(&[2], vec![1.5, -2.0])).unwrap();

        let mut same = Tensor::zeros(&[2]);
        read_tensor(&mut Cursor::new(bytes.clone()), &mut same).unwrap();
        assert_eq!(same.data(), &[1.5, -2.0]);

        let mut other = Tensor::zeros(&[3]);
        assert!(read_tensor(&mut Cursor::new(bytes), &mut other).is_err());
    }
}
