use std::cmp;
use std::io::Read;

/// Read until `buf` is full or the reader hits EoF, returns `(eof, filled)`.
pub fn fill_buf<R: Read>(data: &mut R, buf: &mut [u8]) -> std::io::Result<(bool, usize)> {
    let mut buf_read = 0;

    while buf_read < buf.len() {
        match data.read(&mut buf[buf_read..]) {
            Ok(0) => return Ok((true, buf_read)),
            Ok(x) => buf_read += x,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
    }
    Ok((false, buf_read))
}

/// Copy from `src[offset..]` into `buf`, returns how many bytes were copied.
pub fn copy_at(src: &[u8], offset: usize, buf: &mut [u8]) -> usize {
    if offset >= src.len() {
        return 0;
    }
    // 1. Grab slice [offset...offset + min(buf.len(), remaining))
    let len = cmp::min(src.len() - offset, buf.len());
    // 2. Copy into buf
    buf[..len].copy_from_slice(&src[offset..offset + len]);

    len
}

#[cfg(test)]
mod test_fill_buf {
    use super::*;
    use std::io::Cursor;

    // Hands out at most 3 bytes per read, like a pipe would
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(3);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn short_reads_are_joined() {
        let mut src = Trickle(Cursor::new((0..10).collect()));
        let mut chunk = [0u8; 8];

        assert_eq!(fill_buf(&mut src, &mut chunk).unwrap(), (false, 8));
        assert_eq!(chunk, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(fill_buf(&mut src, &mut chunk).unwrap(), (true, 2));
        assert_eq!(&chunk[..2], &[8, 9]);
    }

    #[test]
    fn exact_fit_is_not_eof() {
        let mut src = Cursor::new(vec![7u8; 4]);
        let mut chunk = [0u8; 4];

        assert_eq!(fill_buf(&mut src, &mut chunk).unwrap(), (false, 4));
        assert_eq!(fill_buf(&mut src, &mut chunk).unwrap(), (true, 0));
    }
}

#[cfg(test)]
mod test_copy_at {
    use super::*;

    #[test]
    fn zero_buf() {
        let src: Vec<u8> = vec![1, 2];
        let mut buf: [u8; 0] = [0; 0];

        assert_eq!(copy_at(&src, 0, &mut buf), 0);
    }

    #[test]
    fn big_buf_small_vec() {
        let src: Vec<u8> = vec![1, 2];
        let mut buf: [u8; 4] = [0; 4];

        assert_eq!(copy_at(&src, 0, &mut buf), 2);
        assert_eq!(&buf, &[1, 2, 0, 0]);
    }

    #[test]
    fn offset_into_vec() {
        let src: Vec<u8> = vec![1, 2, 3, 4];
        let mut buf: [u8; 4] = [0; 4];

        assert_eq!(copy_at(&src, 1, &mut buf), 3);
        assert_eq!(&buf, &[2, 3, 4, 0]);
    }

    #[test]
    fn offset_past_end() {
        let src: Vec<u8> = vec![1, 2, 3, 4];
        let mut buf: [u8; 2] = [0; 2];

        assert_eq!(copy_at(&src, 4, &mut buf), 0);
        assert_eq!(copy_at(&src, 9, &mut buf), 0);
    }
}
