pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_GROUP_SEPARATOR: &str = ".";
pub const DEFAULT_QUEUE_SEPARATOR: &str = ":";
pub const DEFAULT_CONNECTION_NAME: &str = "typebus";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }

    pub(crate) fn map(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// Immutable configuration of a broker instance.
///
/// Built once through the builder; to change anything, build a new instance.
/// Separators are per-instance on purpose: two brokers in one process may use
/// different naming schemes.
#[derive(Debug, Clone)]
pub struct Resources {
    pub group: String,
    pub sub_group: Option<String>,
    pub exchange_kind: ExchangeKind,
    pub group_separator: String,
    pub queue_separator: String,
    pub connection_name: String,
}

impl Resources {
    pub fn builder() -> ResourcesBuilder {
        ResourcesBuilder::default()
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources::builder().build()
    }
}

#[derive(Default)]
pub struct ResourcesBuilder {
    group: Option<String>,
    sub_group: Option<String>,
    exchange_kind: Option<ExchangeKind>,
    group_separator: Option<String>,
    queue_separator: Option<String>,
    connection_name: Option<String>,
}

impl ResourcesBuilder {
    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.group = Some(name.into());
        self
    }

    pub fn sub_group(mut self, name: impl Into<String>) -> Self {
        self.sub_group = Some(name.into());
        self
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    pub fn group_separator(mut self, separator: impl Into<String>) -> Self {
        self.group_separator = Some(separator.into());
        self
    }

    pub fn queue_separator(mut self, separator: impl Into<String>) -> Self {
        self.queue_separator = Some(separator.into());
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn build(self) -> Resources {
        Resources {
            group: self.group.unwrap_or_else(|| DEFAULT_GROUP.to_owned()),
            sub_group: self.sub_group,
            exchange_kind: self.exchange_kind.unwrap_or_default(),
            group_separator: self
                .group_separator
                .unwrap_or_else(|| DEFAULT_GROUP_SEPARATOR.to_owned()),
            queue_separator: self
                .queue_separator
                .unwrap_or_else(|| DEFAULT_QUEUE_SEPARATOR.to_owned()),
            connection_name: self
                .connection_name
                .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_owned()),
        }
    }
}
