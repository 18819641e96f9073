//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (TaskHandler)
//! - Type erasure パターン (TypedHandler<T, H> → TaskHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::HandlerError;

/// Handler は Task を実行して Output を返す
///
/// # 使用例
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     async fn handle(&self, task: SendEmail) -> Result<(), HandlerError> {
///         smtp::send(&task.to).await.map_err(|e| HandlerError::transient(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, HandlerError>;
}

/// TaskHandler は object-safe な handler（bytes in, bytes out）
///
/// `HashMap<TaskType, Arc<dyn TaskHandler>>` に格納できます。
/// 型付きでない payload を扱いたい場合は直接実装してもよい。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle_raw(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle_raw(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        // decode 失敗はリトライしても直らない
        let task: T = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::permanent(format!("payload decode: {e}")))?;
        let output = self.handler.handle(task).await?;
        serde_json::to_vec(&output)
            .map_err(|e| HandlerError::permanent(format!("result encode: {e}")))
    }
}
