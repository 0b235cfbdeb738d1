//! Block storage subsystem collector. Only the shared micro-service series
//! are exported; the subsystem has no resource metrics of its own.

use crate::collector::{ApiSpecifics, MicroService};
use crate::metrics::MetricSink;
use crate::source::{BackendError, DataSource, ResourceKind};

pub(super) struct BlockStorageSpecifics {
    subsystem: String,
}

impl BlockStorageSpecifics {
    pub(super) fn new(subsystem: &str) -> Self {
        Self { subsystem: subsystem.to_string() }
    }
}

impl ApiSpecifics for BlockStorageSpecifics {
    fn define_metrics(&mut self, _sink: &mut dyn MetricSink) {}

    fn micro_services(
        &mut self,
        source: &mut dyn DataSource,
    ) -> Result<Option<Vec<MicroService>>, BackendError> {
        let records = source.list_entities(&self.subsystem, ResourceKind::Services, &[])?;
        Ok(Some(
            records
                .iter()
                .map(|r| MicroService {
                    binary: r.str_field("binary").to_string(),
                    host: r.str_field("host").to_string(),
                    state: r.str_field("state").to_string(),
                    status: r.str_field("status").to_string(),
                })
                .collect(),
        ))
    }

    fn collect(
        &mut self,
        _source: &mut dyn DataSource,
        _sink: &mut dyn MetricSink,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;

    #[test]
    fn test_volume_services_reported_as_micro_services() {
        let mut sp = BlockStorageSpecifics::new("block-storage");
        let mut source = MockSource::small_cloud();
        let services = sp.micro_services(&mut source).unwrap().unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].binary, "cinder-volume");
        assert_eq!(services[0].host, "stor1");
    }
}
