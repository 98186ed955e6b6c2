use crate::plant::CycleReport;

pub trait MetricCollector {
    fn publish(&mut self, report: &CycleReport);
}
