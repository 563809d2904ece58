use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::command::CommandError;
use crate::error::{CancellationReason, DispatchError};

/// `submit_*` 返回的异步结果句柄。
///
/// - 完成后产出与对应 `execute_*` 相同的结果；
/// - [`Self::cancel`] 中止尚未完成的远端等待，句柄随后产出
///   `Cancelled { reason: Caller }`；已开始的本地执行会运行到结束，但结果被丢弃；
/// - 完成后再次轮询返回 [`DispatchError::Closed`]。
#[must_use = "futures do nothing unless awaited"]
pub struct CommandFuture<T> {
    state: State<T>,
}

enum State<T> {
    Ready(Option<Result<T, DispatchError>>),
    Running(JoinHandle<Result<T, DispatchError>>),
    Done,
}

impl<T> Unpin for CommandFuture<T> {}

impl<T> CommandFuture<T> {
    pub(crate) fn ready(result: Result<T, DispatchError>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    pub(crate) fn running(handle: JoinHandle<Result<T, DispatchError>>) -> Self {
        Self {
            state: State::Running(handle),
        }
    }

    pub fn cancel(&self) {
        if let State::Running(handle) = &self.state {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Running(handle) => handle.is_finished(),
            State::Ready(_) | State::Done => true,
        }
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = Result<T, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let output = match &mut this.state {
            State::Ready(slot) => slot.take().unwrap_or(Err(DispatchError::Closed)),
            State::Running(handle) => match Pin::new(handle).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(err)) if err.is_cancelled() => Err(DispatchError::Cancelled {
                    reason: CancellationReason::Caller,
                }),
                Poll::Ready(Err(err)) => {
                    let payload = err.into_panic();
                    Err(DispatchError::Execution(CommandError::panicked(payload.as_ref())))
                }
            },
            State::Done => Err(DispatchError::Closed),
        };
        this.state = State::Done;
        Poll::Ready(output)
    }
}

impl<T> std::fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFuture")
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_handle_reports_caller_cancellation() {
        let future: CommandFuture<u32> = CommandFuture::running(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        }));
        future.cancel();
        let error = future.await.expect_err("aborted");
        assert!(error.is_cancellation());
        assert!(!error.is_target_not_found());
    }

    #[tokio::test]
    async fn ready_handle_yields_its_value() {
        let future = CommandFuture::ready(Ok("done"));
        assert!(future.is_finished());
        assert_eq!(future.await.expect("value"), "done");
    }
}
