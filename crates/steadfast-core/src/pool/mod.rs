//! Connection-pool isolation.
//!
//! Every request is routed to a pool identified by its normalized base
//! address plus its [`TrafficClass`]. Two classes never share a pool, even
//! against the same address, so a burst of sampling calls cannot starve
//! training calls of connections.

mod key;
mod router;

pub use key::{PoolKey, TrafficClass};
pub use router::PoolRouter;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn pool_key_normalizes_scheme_host_port_and_trailing_slash() {
        let a = PoolKey::new("HTTPS://API.Example.com/v1/", TrafficClass::Training).unwrap();
        let b = PoolKey::new("https://api.example.com:443/v1", TrafficClass::Training).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.base(), "https://api.example.com:443/v1");
        assert_eq!(a.destination(), "https://api.example.com:443");
    }

    #[test]
    fn pool_key_drops_query_and_fragment() {
        let k = PoolKey::new("http://h:8080/a//?x=1#frag", TrafficClass::Session).unwrap();
        assert_eq!(k.base(), "http://h:8080/a");
    }

    #[test]
    fn pool_key_for_origin_ignores_path() {
        let k = PoolKey::for_origin("http://h/api/v1/futures/retrieve", TrafficClass::Futures)
            .unwrap();
        assert_eq!(k.base(), "http://h:80");
    }

    #[test]
    fn invalid_address_is_rejected() {
        let err = PoolKey::new("not a url", TrafficClass::Session).unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidAddress { .. }));
    }

    #[test]
    fn traffic_class_round_trips_through_str() {
        for class in TrafficClass::ALL {
            assert_eq!(class.as_str().parse::<TrafficClass>().unwrap(), class);
        }
        assert!("bulk".parse::<TrafficClass>().is_err());
    }

    #[test]
    fn classes_get_distinct_pools_and_same_args_share_one() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let router = PoolRouter::new(move |key: &PoolKey| {
            counter.fetch_add(1, Ordering::SeqCst);
            key.clone()
        });

        let training = router.resolve("https://api.example.com", TrafficClass::Training).unwrap();
        let sampling = router.resolve("https://api.example.com", TrafficClass::Sampling).unwrap();
        let again = router.resolve("https://api.example.com/", TrafficClass::Training).unwrap();

        assert!(!Arc::ptr_eq(&training, &sampling));
        assert!(Arc::ptr_eq(&training, &again));
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(router.len(), 2);
    }
}
