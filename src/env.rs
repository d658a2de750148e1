use once_cell::sync::Lazy;

pub static GANETI_TAG_PREFIX: Lazy<String> =
    Lazy::new(|| std::env::var("GANETI_TAG_PREFIX").unwrap_or_else(|_| "gnt".to_owned()));

pub static RAPI_CONNECT_TIMEOUT: Lazy<u64> = Lazy::new(|| {
    if let Ok(s) = std::env::var("RAPI_CONNECT_TIMEOUT") {
        s.parse::<u64>().unwrap()
    } else {
        5
    }
});

pub static RAPI_RESPONSE_TIMEOUT: Lazy<u64> = Lazy::new(|| {
    if let Ok(s) = std::env::var("RAPI_RESPONSE_TIMEOUT") {
        s.parse::<u64>().unwrap()
    } else {
        15
    }
});

pub static BEANSTALKD_HOST: Lazy<String> =
    Lazy::new(|| std::env::var("BEANSTALKD_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned()));

pub static BEANSTALKD_PORT: Lazy<u16> = Lazy::new(|| {
    if let Ok(s) = std::env::var("BEANSTALKD_PORT") {
        s.parse::<u16>().unwrap()
    } else {
        11300
    }
});

// Tube to publish JOB_LOCK messages on. When unset the default tube is used.
pub static BEANSTALK_TUBE: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("BEANSTALK_TUBE").ok());

// Days a pending instance action stays activatable before it expires.
pub static INSTANCE_ACTION_ACTIVE_DAYS: Lazy<i64> = Lazy::new(|| {
    if let Ok(s) = std::env::var("INSTANCE_ACTION_ACTIVE_DAYS") {
        s.parse::<i64>().unwrap()
    } else {
        7
    }
});

// First Ganeti release whose RAPI accepts clear_osparams on reinstall.
pub const GANETI_VERSION_OSPARAMS: &str = "2.16.0";
