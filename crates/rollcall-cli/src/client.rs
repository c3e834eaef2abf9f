use zbus::proxy;

/// Client side of the daemon's `org.rollcall.Attendance1` interface.
#[proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
pub trait Attendance {
    fn enroll(&self, student_json: &str, image: &[u8]) -> zbus::Result<String>;
    fn take_attendance(&self, session_json: &str, image: &[u8]) -> zbus::Result<String>;
    fn list_students(&self) -> zbus::Result<String>;
    fn list_sessions(&self, search: &str, since: &str, until: &str, limit: u32) -> zbus::Result<String>;
    fn session_attendance(&self, session_id: &str) -> zbus::Result<String>;
    fn student_attendance(&self, student_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

/// Turn a daemon error reply into a message for the terminal.
pub fn describe(e: zbus::Error) -> anyhow::Error {
    match e {
        zbus::Error::MethodError(name, detail, _) => {
            let short = name.as_str().rsplit('.').next().unwrap_or_default().to_string();
            let detail = detail.unwrap_or_default();
            match short.as_str() {
                "NoFaceDetected" => anyhow::anyhow!("no face found in the image; retake the picture"),
                "ModelUnavailable" => anyhow::anyhow!("face detector unavailable, try again later: {detail}"),
                "Timeout" => anyhow::anyhow!("face detection timed out, try again: {detail}"),
                _ => anyhow::anyhow!("{short}: {detail}"),
            }
        }
        other => anyhow::Error::new(other).context("talking to rollcalld"),
    }
}
