//! Client side of the `org.rollcall.Attendance1` interface.

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
pub trait Attendance {
    fn attend(&self, request: &str) -> zbus::Result<String>;

    fn enroll(&self, request: &str) -> zbus::Result<String>;

    fn update_face(&self, request: &str) -> zbus::Result<String>;

    fn history(&self, user: &str, from: &str, to: &str) -> zbus::Result<String>;

    fn analytics(&self, user: &str, from: &str, to: &str) -> zbus::Result<String>;

    fn status(&self) -> zbus::Result<String>;
}
