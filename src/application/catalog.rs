//! Known resource tables.

use crate::application::remote::Order;
use crate::application::resource::ResourceSpec;

pub fn users() -> ResourceSpec {
    ResourceSpec::new("users", "id").order_by(Order::asc("created_at"))
}

pub fn posts() -> ResourceSpec {
    ResourceSpec::new("posts", "id").order_by(Order::desc("created_at"))
}

pub fn teams() -> ResourceSpec {
    ResourceSpec::new("teams", "id").order_by(Order::asc("name"))
}

pub fn weeks() -> ResourceSpec {
    ResourceSpec::new("weeks", "id").order_by(Order::asc("id"))
}

pub fn missions() -> ResourceSpec {
    ResourceSpec::new("missions", "id").order_by(Order::asc("week_id"))
}

pub fn journeys() -> ResourceSpec {
    ResourceSpec::new("journeys", "id").order_by(Order::desc("created_at"))
}

pub fn notifications() -> ResourceSpec {
    ResourceSpec::new("notifications", "id").order_by(Order::desc("created_at"))
}

pub fn all() -> Vec<ResourceSpec> {
    vec![
        users(),
        posts(),
        teams(),
        weeks(),
        missions(),
        journeys(),
        notifications(),
    ]
}

pub fn lookup(name: &str) -> Option<ResourceSpec> {
    all().into_iter().find(|spec| spec.name == name)
}
