//! Scoped evaluation mode

use std::ops::{Deref, DerefMut};

use crate::model::CvaeModel;

/// Puts the model in evaluation mode for the guard's lifetime
///
/// The prior training/eval state is restored on drop, so validation never
/// leaks eval mode into the training loop, including on early error returns.
pub struct EvalGuard<'a, M: CvaeModel + ?Sized> {
    model: &'a mut M,
    was_training: bool,
}

impl<'a, M: CvaeModel + ?Sized> EvalGuard<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        let was_training = model.is_training();
        model.set_training(false);
        Self {
            model,
            was_training,
        }
    }
}

impl<M: CvaeModel + ?Sized> Deref for EvalGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: CvaeModel + ?Sized> DerefMut for EvalGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: CvaeModel + ?Sized> Drop for EvalGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_training(self.was_training);
    }
}
