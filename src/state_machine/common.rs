// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tokio_util::sync::CancellationToken;

/// Outcome of one state step.
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

/// One state of a typestate machine: a step consumes the shared context and
/// yields a [`Transition`].
pub trait StateMachine<Ctx, RespCtx>: Sized {
    type StepResult<'a>: Future<Output = RespCtx> + Send + 'a
    where
        Self: 'a,
        RespCtx: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Driver side: a context that owns the current state and steps it to
/// completion.
pub trait StateMachineCtx<Out> {
    fn execute(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Out> + Send;
}
