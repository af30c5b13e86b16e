// crates/mixcast-render/src/stack.rs
//
// LIFO transform stack for the render pass, with balance enforced by a
// guard that pops on drop. The compositor pushes the projection once per
// pass and each source's model matrix around its draw; any early return
// or panic unwinds the guards and the stack stays balanced.

use mixcast_core::transform::{mat4_identity, mat4_mul, Mat4};

pub struct TransformStack {
    stack: Vec<Mat4>,
}

impl Default for TransformStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformStack {
    pub fn new() -> Self {
        Self {
            stack: vec![mat4_identity()],
        }
    }

    /// The composition of everything pushed so far.
    pub fn current(&self) -> Mat4 {
        *self.stack.last().expect("stack never empties")
    }

    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Push `m` composed onto the current top. The returned guard pops it
    /// when dropped.
    pub fn push(&mut self, m: &Mat4) -> StackGuard<'_> {
        let composed = mat4_mul(&self.current(), m);
        self.stack.push(composed);
        StackGuard { stack: self }
    }
}

/// Balances the stack on every exit path.
pub struct StackGuard<'a> {
    stack: &'a mut TransformStack,
}

impl StackGuard<'_> {
    pub fn current(&self) -> Mat4 {
        self.stack.current()
    }

    /// Push another matrix beneath this guard (nested scopes).
    pub fn push(&mut self, m: &Mat4) -> StackGuard<'_> {
        self.stack.push(m)
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.stack.stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixcast_core::transform::{mat4_apply, mat4_scale, mat4_translate};

    #[test]
    fn guards_balance_on_scope_exit() {
        let mut stack = TransformStack::new();
        {
            let mut outer = stack.push(&mat4_translate(10.0, 0.0));
            {
                let inner = outer.push(&mat4_scale(2.0, 2.0));
                let (x, y) = mat4_apply(&inner.current(), 1.0, 1.0);
                assert_eq!((x, y), (12.0, 2.0));
            }
            // inner popped; outer alone remains
            let (x, _) = mat4_apply(&outer.current(), 1.0, 0.0);
            assert_eq!(x, 11.0);
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn early_return_still_pops() {
        fn draws(stack: &mut TransformStack, bail: bool) -> Option<()> {
            let _guard = stack.push(&mat4_translate(5.0, 5.0));
            if bail {
                return None;
            }
            Some(())
        }
        let mut stack = TransformStack::new();
        draws(&mut stack, true);
        draws(&mut stack, false);
        assert_eq!(stack.depth(), 0);
    }
}
