//! MDS load calculation

use crate::common::{round5, Result};
use crate::dal::{MdsServiceId, Tables};

/// Current and next load (percent) of a service with `capacity` serving
/// `usage` vdisks. Negative capacity reports a flat 50%; zero capacity is an
/// infinite load so the service is never picked.
pub fn get_mds_load(capacity: i64, usage: usize) -> (f64, f64) {
    if capacity < 0 {
        return (50.0, 50.0);
    }
    if capacity == 0 {
        return (f64::INFINITY, f64::INFINITY);
    }
    let capacity = capacity as f64;
    (
        round5(usage as f64 / capacity * 100.0),
        round5((usage + 1) as f64 / capacity * 100.0),
    )
}

pub fn mds_load(tables: &Tables, mds_service: MdsServiceId) -> Result<(f64, f64)> {
    let service = tables.mds_service(mds_service)?;
    Ok(get_mds_load(
        service.capacity,
        tables.vdisk_count_of(mds_service),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_capacity() {
        assert_eq!(get_mds_load(10, 0), (0.0, 10.0));
        assert_eq!(get_mds_load(10, 7), (70.0, 80.0));
        assert_eq!(get_mds_load(3, 1), (33.33333, 66.66667));
    }

    #[test]
    fn test_special_capacities() {
        assert_eq!(get_mds_load(-1, 500), (50.0, 50.0));
        let (current, next) = get_mds_load(0, 0);
        assert!(current.is_infinite() && next.is_infinite());
    }
}
