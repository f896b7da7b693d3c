//! 下载事件监听
//!
//! 监听器在状态转换之后尽力通知，按注册顺序同步回调。分发前先
//! 拷贝监听器列表，回调过程中注册 / 注销不会影响本轮分发，也不会
//! 出现迭代中修改集合的问题。

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

use crate::status::DownloadStatus;

/// 下载事件监听器
///
/// 所有方法默认空实现，按需覆盖。回调收到的是状态快照而非会话
/// 内部的可变状态；慢速监听器会拖慢触发它的那次进度上报。
pub trait DownloadListener: Send + Sync {
    /// 进度更新（约每秒一次）
    fn on_progress(&self, _status: &DownloadStatus) {}

    /// 下载成功完成
    fn on_complete(&self, _status: &DownloadStatus) {}

    /// 会话被暂停
    fn on_pause(&self, _status: &DownloadStatus) {}

    /// 会话从暂停恢复
    fn on_resume(&self, _status: &DownloadStatus, _save_path: &Path) {}

    /// 会话因错误终止
    fn on_error(&self, _status: &DownloadStatus, _reason: &str) {}
}

/// 监听器集合，拷贝后迭代分发
#[derive(Default)]
pub(crate) struct ListenerBus {
    listeners: RwLock<Vec<Arc<dyn DownloadListener>>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DownloadListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn DownloadListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// 按注册顺序分发一个事件
    pub fn emit<F>(&self, f: F)
    where
        F: Fn(&dyn DownloadListener),
    {
        let snapshot: Vec<Arc<dyn DownloadListener>> = self.listeners.read().clone();
        for listener in snapshot {
            f(listener.as_ref());
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }
}
