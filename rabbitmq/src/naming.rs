use crate::resources::Resources;

/// Resolves logical queue names to broker-side identifiers.
///
/// Pure string work, no caching: `group[.sub_group]:logical_name` with the
/// separators coming from [`Resources`]. The binding key is the logical name
/// itself and the exchange is always the group.
#[derive(Debug, Clone)]
pub struct QueueNaming {
    group: String,
    sub_group: Option<String>,
    group_separator: String,
    queue_separator: String,
}

impl QueueNaming {
    pub fn new(resources: &Resources) -> Self {
        QueueNaming {
            group: resources.group.clone(),
            sub_group: resources.sub_group.clone(),
            group_separator: resources.group_separator.clone(),
            queue_separator: resources.queue_separator.clone(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.group
    }

    pub fn routing_key<'n>(&self, logical_name: &'n str) -> &'n str {
        logical_name
    }

    pub fn physical_name(&self, logical_name: &str) -> String {
        match &self.sub_group {
            Some(sub_group) => format!(
                "{}{}{}{}{}",
                self.group, self.group_separator, sub_group, self.queue_separator, logical_name
            ),
            None => format!("{}{}{}", self.group, self.queue_separator, logical_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_resolve_physical_name_with_sub_group() {
        let resources = Resources::builder().group("g").sub_group("s").build();
        let naming = QueueNaming::new(&resources);

        assert_eq!(naming.physical_name("q"), "g.s:q");
    }

    #[test]
    fn should_resolve_physical_name_without_sub_group() {
        let resources = Resources::builder().group("g").build();
        let naming = QueueNaming::new(&resources);

        assert_eq!(naming.physical_name("q"), "g:q");
    }

    #[test]
    fn should_use_configured_separators() {
        let resources = Resources::builder()
            .group("g")
            .sub_group("s")
            .group_separator("/")
            .queue_separator("-")
            .build();
        let naming = QueueNaming::new(&resources);

        assert_eq!(naming.physical_name("q"), "g/s-q");
    }

    #[test]
    fn should_bind_with_logical_name_on_group_exchange() {
        let resources = Resources::builder().group("g").build();
        let naming = QueueNaming::new(&resources);

        assert_eq!(naming.exchange(), "g");
        assert_eq!(naming.routing_key("q"), "q");
    }
}
