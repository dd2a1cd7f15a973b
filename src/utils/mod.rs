// Jackson Coxson

pub mod plist;
