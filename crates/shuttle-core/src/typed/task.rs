//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Associated Types (`type Output`)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task_type と payload / result の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const TYPE: &'static str = "acme.mail.send.v1";
///     type Output = ();
/// }
/// ```
///
/// Payload と result はどちらも JSON バイト列として TaskStore に保存されます。
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// `{namespace}.{domain}.{action}.v{major}` を推奨
    const TYPE: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;
}
