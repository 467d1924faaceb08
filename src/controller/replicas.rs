//! Percentage to replica-count arithmetic

/// Replica count needed to satisfy `percent` of a `total` fleet
///
/// Rounds up to the nearest whole replica so a non-zero percentage never
/// maps to zero replicas.
pub fn calculate_desired_replica_count(total: u32, percent: f64) -> u32 {
    (f64::from(total) * percent / 100.0).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_percentages() {
        assert_eq!(calculate_desired_replica_count(10, 0.0), 0);
        assert_eq!(calculate_desired_replica_count(10, 50.0), 5);
        assert_eq!(calculate_desired_replica_count(10, 100.0), 10);
    }

    #[test]
    fn fractional_results_round_up() {
        assert_eq!(calculate_desired_replica_count(10, 25.0), 3);
        assert_eq!(calculate_desired_replica_count(3, 50.0), 2);
        assert_eq!(calculate_desired_replica_count(7, 1.0), 1);
    }

    #[test]
    fn empty_fleet_is_zero() {
        assert_eq!(calculate_desired_replica_count(0, 100.0), 0);
    }
}
