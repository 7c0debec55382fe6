/*!
 * Checked Arguments
 *
 * Output buffers handed to a primitive are owned here for the duration of
 * one call. Bytes past each buffer's visible prefix are snapshotted on
 * install and compared after the call; a primitive that writes beyond the
 * length it was given is reported as corrupting its argument.
 */

use crate::core::errors::{RpcErrno, ToRpcErrno};
use miette::Diagnostic;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum CheckedArgError {
    #[error(
        "Argument {name}: visible length is {len_visible}, declared length is {len}, \
         but byte {offset} was modified"
    )]
    #[diagnostic(
        code(checked_arg::corrupted),
        help("The callee wrote past the length it was allowed to modify.")
    )]
    Corrupted {
        name: String,
        len: usize,
        len_visible: usize,
        offset: usize,
    },
}

impl ToRpcErrno for CheckedArgError {
    fn rpc_errno(&self) -> RpcErrno {
        RpcErrno::Corrupted
    }
}

/// One registered buffer
#[derive(Debug)]
pub struct CheckedArg {
    name: String,
    data: Vec<u8>,
    len_visible: usize,
    /// Copy of `data[len_visible..]`, empty when nothing is checked
    pristine: Vec<u8>,
}

impl CheckedArg {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_checked(&self) -> bool {
        !self.pristine.is_empty()
    }
}

/// Per-call stack of checked buffers
#[derive(Debug, Default)]
pub struct CheckedArgs {
    args: Vec<CheckedArg>,
}

impl CheckedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `data`, allowing the callee to modify only
    /// `data[..len_visible]`. Returns the slot index.
    pub fn install(&mut self, name: impl Into<String>, data: Vec<u8>, len_visible: usize) -> usize {
        let pristine = if data.len() > len_visible {
            data[len_visible..].to_vec()
        } else {
            Vec::new()
        };
        self.args.push(CheckedArg {
            name: name.into(),
            data,
            len_visible,
            pristine,
        });
        self.args.len() - 1
    }

    #[inline]
    pub fn buffer(&self, slot: usize) -> &[u8] {
        &self.args[slot].data
    }

    #[inline]
    pub fn buffer_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.args[slot].data
    }

    /// Visible prefixes of consecutive slots, for vectored primitives
    pub fn visible(&self, slots: Range<usize>) -> Vec<&[u8]> {
        self.args[slots]
            .iter()
            .map(|arg| &arg.data[..arg.len_visible.min(arg.data.len())])
            .collect()
    }

    pub fn visible_mut(&mut self, slots: Range<usize>) -> Vec<&mut [u8]> {
        self.args[slots]
            .iter_mut()
            .map(|arg| {
                let end = arg.len_visible.min(arg.data.len());
                &mut arg.data[..end]
            })
            .collect()
    }

    /// Raw pointer to pass to a primitive; valid until the slot is taken
    #[inline]
    pub fn as_mut_ptr(&mut self, slot: usize) -> *mut u8 {
        self.args[slot].data.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Compare every checked tail in LIFO order
    ///
    /// All corrupted tails are restored from their snapshots; the first
    /// violation found (last installed) is returned.
    pub fn verify(&mut self) -> Result<(), CheckedArgError> {
        let mut first = None;

        for arg in self.args.iter_mut().rev() {
            if !arg.is_checked() {
                continue;
            }
            let data_len = arg.data.len();
            let tail = &mut arg.data[arg.len_visible..];
            let Some(pos) = tail.iter().zip(&arg.pristine).position(|(a, b)| a != b) else {
                continue;
            };

            let err = CheckedArgError::Corrupted {
                name: arg.name.clone(),
                len: data_len,
                len_visible: arg.len_visible,
                offset: arg.len_visible + pos,
            };
            tracing::error!(
                argument = %arg.name,
                len = data_len,
                len_visible = arg.len_visible,
                offset = arg.len_visible + pos,
                "checked argument corrupted beyond its visible length"
            );
            tail.copy_from_slice(&arg.pristine);
            first.get_or_insert(err);
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Move a buffer out; the slot is left empty
    pub fn take(&mut self, slot: usize) -> Vec<u8> {
        std::mem::take(&mut self.args[slot].data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_vectored_prefixes_stay_inside_visible_length() {
        let mut args = CheckedArgs::new();
        let first = args.install("iov0", vec![0u8; 8], 3);
        args.install("iov1", vec![0u8; 4], 4);

        let lens: Vec<_> = args.visible(first..first + 2).iter().map(|b| b.len()).collect();
        assert_eq!(lens, vec![3, 4]);
        for buf in args.visible_mut(first..first + 2) {
            buf.fill(0x33);
        }
        assert!(args.verify().is_ok());
        assert_eq!(&args.buffer(first)[..4], &[0x33, 0x33, 0x33, 0]);
    }

    #[test]
    fn test_write_inside_prefix_is_allowed() {
        let mut args = CheckedArgs::new();
        let slot = args.install("buf", vec![0u8; 128], 64);

        args.buffer_mut(slot)[..64].fill(0x55);
        assert_eq!(args.verify(), Ok(()));
        assert_eq!(args.buffer(slot)[63], 0x55);
    }

    #[test]
    fn test_write_past_prefix_is_corrupted_and_restored() {
        let mut args = CheckedArgs::new();
        let slot = args.install("buf", vec![0u8; 128], 64);

        unsafe { *args.as_mut_ptr(slot).add(70) = 0xFF };

        let err = args.verify().unwrap_err();
        assert_eq!(
            err,
            CheckedArgError::Corrupted {
                name: "buf".into(),
                len: 128,
                len_visible: 64,
                offset: 70,
            }
        );
        assert_eq!(err.rpc_errno(), RpcErrno::Corrupted);
        assert_eq!(args.take(slot)[70], 0);
    }

    #[test]
    fn test_nothing_checked_when_fully_visible() {
        let mut args = CheckedArgs::new();
        let slot = args.install("buf", vec![1u8; 16], 16);

        args.buffer_mut(slot).fill(9);
        assert_eq!(args.verify(), Ok(()));
    }

    #[test]
    fn test_lifo_reports_last_installed() {
        let mut args = CheckedArgs::new();
        let a = args.install("first", vec![0u8; 8], 4);
        let b = args.install("second", vec![0u8; 8], 4);

        args.buffer_mut(a)[5] = 1;
        args.buffer_mut(b)[6] = 1;

        match args.verify() {
            Err(CheckedArgError::Corrupted { name, .. }) => assert_eq!(name, "second"),
            other => panic!("expected corruption, got {:?}", other),
        }
        assert_eq!(args.buffer(a)[5], 0);
        assert_eq!(args.buffer(b)[6], 0);
    }
}
