/// Simple localization support for the CLI surface.
/// Locale can be selected via the `--locale` flag (e.g. `--locale zh`).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "zh_cn" | "zh-hans" | "zh-tw" | "zh_tw" => Self::Zh,
            _ => Self::En,
        }
    }
}

pub struct Messages {
    pub job_added: &'static str,
    pub metadata_resolving: &'static str,
    pub policy_rejected: &'static str,
    pub selection_pending: &'static str,
    pub job_completed: &'static str,
    pub seeding_started: &'static str,
    pub job_removed: &'static str,
    pub all_done: &'static str,
    pub error_prefix: &'static str,
    pub status_header: &'static str,
    pub seeding_label: &'static str,
    pub transferring_label: &'static str,
}

pub static EN: Messages = Messages {
    job_added: "job added",
    metadata_resolving: "resolving metadata",
    policy_rejected: "rejected",
    selection_pending: "paused for file selection",
    job_completed: "completed",
    seeding_started: "seeding",
    job_removed: "removed",
    all_done: "All jobs finished",
    error_prefix: "ERR",
    status_header: "Tracked jobs",
    seeding_label: "seeding",
    transferring_label: "transferring",
};

pub static ZH: Messages = Messages {
    job_added: "任务已添加",
    metadata_resolving: "正在解析元数据",
    policy_rejected: "已拒绝",
    selection_pending: "已暂停等待选择文件",
    job_completed: "已完成",
    seeding_started: "做种中",
    job_removed: "已移除",
    all_done: "所有任务已完成",
    error_prefix: "错误",
    status_header: "跟踪中的任务",
    seeding_label: "做种",
    transferring_label: "传输中",
};

pub fn get_messages(locale: Locale) -> &'static Messages {
    match locale {
        Locale::En => &EN,
        Locale::Zh => &ZH,
    }
}
