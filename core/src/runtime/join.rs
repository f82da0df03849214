//! Fixed-size join over futures polled within one task

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

enum Member<F: Future> {
    Running(Pin<Box<F>>),
    Done(Option<F::Output>),
}

/// Future returned by [`join_all`]
#[must_use = "futures do nothing unless awaited"]
pub struct JoinAll<F: Future> {
    members: Vec<Member<F>>,
}

// Members are boxed; outputs are never pinned.
impl<F: Future> Unpin for JoinAll<F> {}

/// Wait for every future in the set, returning outputs in submission order.
///
/// A member that fails (returns `Err`) does not stop the others. Callers that
/// want all-or-nothing must cancel explicitly.
pub fn join_all<I>(futures: I) -> JoinAll<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    JoinAll {
        members: futures
            .into_iter()
            .map(|f| Member::Running(Box::pin(f)))
            .collect(),
    }
}

impl<F: Future> Future for JoinAll<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for member in this.members.iter_mut() {
            if let Member::Running(future) = member {
                match future.as_mut().poll(cx) {
                    Poll::Ready(output) => *member = Member::Done(Some(output)),
                    Poll::Pending => all_done = false,
                }
            }
        }
        if !all_done {
            return Poll::Pending;
        }
        Poll::Ready(
            core::mem::take(&mut this.members)
                .into_iter()
                .filter_map(|member| match member {
                    Member::Done(output) => output,
                    Member::Running(_) => None,
                })
                .collect(),
        )
    }
}
