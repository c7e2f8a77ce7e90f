use super::*;
use crate::core::{fixtures, Distro, Location};
use crate::net::{CmdOutput, TransportError};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

/// Records every operation it is asked to perform, in order. Uploads are
/// recorded in the same form [Step] displays them, so a recorded sequence can be
/// compared directly against a debug-mode printout.
struct TestTransport {
    ops: Rc<RefCell<Vec<String>>>,

    /// Responses for specific command texts; everything else succeeds with empty
    /// output.
    responses: HashMap<String, CmdOutput>,
}

impl TestTransport {
    fn new() -> (Self, Rc<RefCell<Vec<String>>>) {
        let ops = Rc::new(RefCell::new(vec![]));
        (
            TestTransport {
                ops: ops.clone(),
                responses: HashMap::new(),
            },
            ops,
        )
    }

    fn respond(mut self, command: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.responses.insert(
            command.to_string(),
            CmdOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
        self
    }
}

impl Transport for TestTransport {
    fn run(&mut self, command: &str) -> Result<CmdOutput, TransportError> {
        self.run_elevated(command, "")
    }

    fn run_elevated(&mut self, command: &str, _secret: &str) -> Result<CmdOutput, TransportError> {
        self.ops.borrow_mut().push(command.to_string());
        Ok(self.responses.get(command).cloned().unwrap_or(CmdOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<(), TransportError> {
        self.ops
            .borrow_mut()
            .push(format!("Copying {} to {remote_dir}", local.display()));
        Ok(())
    }
}

fn context() -> RunContext {
    RunContext::for_testing("unused")
}

fn dispatcher<'a>(
    ctx: &'a RunContext,
    transport: TestTransport,
    out: &'a mut Vec<u8>,
) -> Dispatcher<'a, TestTransport, &'a mut Vec<u8>> {
    let config = fixtures::connection_config();
    let session = Session::new(transport, &config, Distro::new("debian"));
    Dispatcher::new(ctx, &config, Some(session), out)
}

fn plain(command: &str) -> CommandInfo {
    CommandInfo {
        command: command.to_string(),
        location: Location::Remote,
        extra: Extra::None,
    }
}

fn alice_key() -> KeyRecipient {
    KeyRecipient {
        username: "alice".to_string(),
        key: "/keys/alice.pub".into(),
    }
}

/// The step sequence an SSH key installation for alice consists of, starting
/// from the home directory probe.
fn alice_key_steps(home: &str) -> Vec<String> {
    vec![
        "getent passwd alice | cut -d: -f6".to_string(),
        "mkdir -p /tmp/alice".to_string(),
        "chown archie:archie /tmp/alice".to_string(),
        format!("mkdir -p {home}/.ssh"),
        "Copying /keys/alice.pub to /tmp/alice".to_string(),
        format!("cp /tmp/alice/alice.pub {home}/.ssh/authorized_keys"),
        format!("chmod 700 {home}/.ssh"),
        format!("chmod 600 {home}/.ssh/authorized_keys"),
        format!("chown alice:alice {home}/.ssh"),
        format!("chown alice:alice -R {home}/.ssh"),
        "rm -rf /tmp/alice".to_string(),
    ]
}

mod run_remote {
    use super::*;

    #[test]
    fn runs_a_plain_command() {
        let ctx = context();
        let (transport, ops) = TestTransport::new();
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        assert!(dispatcher.run_remote(&plain("apt update")));
        assert_eq!(vec!["apt update"], *ops.borrow());
    }

    #[test]
    fn a_reboot_command_wipes_the_workspace_first() {
        let ctx = context();
        let (transport, ops) = TestTransport::new();
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        assert!(dispatcher.run_remote(&plain("systemctl reboot")));
        assert_eq!(
            vec!["rm -rf /tmp/provis", "systemctl reboot"],
            *ops.borrow()
        );
    }

    #[test]
    fn copy_uploads_into_the_workspace_and_expands_the_token() {
        let ctx = context();
        let (transport, ops) = TestTransport::new();
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        let info = CommandInfo {
            command: "install -m 644 $PATH$/app.conf /etc/app.conf".to_string(),
            location: Location::Remote,
            extra: Extra::Copy("/local/app.conf".into()),
        };
        assert!(dispatcher.run_remote(&info));
        assert_eq!(
            vec![
                "mkdir -p /tmp/provis",
                "chown archie:archie /tmp/provis",
                "Copying /local/app.conf to /tmp/provis",
                "install -m 644 /tmp/provis/app.conf /etc/app.conf",
            ],
            *ops.borrow()
        );
    }

    #[test]
    fn a_failure_with_the_marker_counts_as_success() {
        let ctx = context();
        let (transport, _) = TestTransport::new();
        let transport = transport.respond(
            "apt install -y nginx",
            1,
            "",
            "nginx is already the newest version",
        );
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        assert!(dispatcher.run_remote(&plain("apt install -y nginx")));
        drop(dispatcher);
        assert!(out.is_empty());
    }

    #[test]
    fn a_plain_failure_is_reported() {
        let ctx = context();
        let (transport, _) = TestTransport::new();
        let transport = transport.respond("apt install -y nginx", 100, "", "E: broken packages\n");
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        assert!(!dispatcher.run_remote(&plain("apt install -y nginx")));
        drop(dispatcher);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("Command failed: apt install -y nginx"));
        assert!(printed.contains("E: broken packages"));
    }

    #[test]
    fn installs_an_ssh_key_in_order() {
        let ctx = context();
        let (transport, ops) = TestTransport::new();
        let transport = transport.respond(
            "getent passwd alice | cut -d: -f6",
            0,
            "/home/alice\n",
            "",
        );
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        let info = CommandInfo {
            command: String::new(),
            location: Location::Remote,
            extra: Extra::CopySshKey(alice_key()),
        };
        assert!(dispatcher.run_remote(&info));
        assert_eq!(alice_key_steps("/home/alice"), *ops.borrow());
    }

    #[test]
    fn a_failed_key_install_is_reported() {
        let ctx = context();
        let (transport, ops) = TestTransport::new();
        let transport = transport.respond("getent passwd alice | cut -d: -f6", 2, "", "");
        let mut out = Vec::new();
        let mut dispatcher = dispatcher(&ctx, transport, &mut out);

        let info = CommandInfo {
            command: String::new(),
            location: Location::Remote,
            extra: Extra::CopySshKey(alice_key()),
        };
        assert!(!dispatcher.run_remote(&info));
        drop(dispatcher);

        // The probe failed, so nothing else ran.
        assert_eq!(1, ops.borrow().len());
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("Unable to copy /keys/alice.pub over to alice"));
    }
}

mod debug_mode {
    use super::*;

    fn debug_context() -> RunContext {
        let mut ctx = context();
        ctx.debug = true;
        ctx
    }

    /// A dispatcher with no session at all. Everything in debug mode must work
    /// without one.
    fn debug_dispatcher<'a>(
        ctx: &'a RunContext,
        out: &'a mut Vec<u8>,
    ) -> Dispatcher<'a, TestTransport, &'a mut Vec<u8>> {
        Dispatcher::new(ctx, &fixtures::connection_config(), None, out)
    }

    fn printed_lines(out: Vec<u8>) -> Vec<String> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn prints_the_same_sequence_it_would_run() {
        let info = CommandInfo {
            command: "install -m 644 $PATH$/app.conf /etc/app.conf".to_string(),
            location: Location::Remote,
            extra: Extra::Copy("/local/app.conf".into()),
        };

        let ctx = context();
        let (transport, ops) = TestTransport::new();
        let mut real_out = Vec::new();
        let mut real = dispatcher(&ctx, transport, &mut real_out);
        assert!(real.run_remote(&info));
        drop(real);

        let debug_ctx = debug_context();
        let mut debug_out = Vec::new();
        let mut debug = debug_dispatcher(&debug_ctx, &mut debug_out);
        assert!(debug.run_remote(&info));
        drop(debug);

        assert_eq!(*ops.borrow(), printed_lines(debug_out));
    }

    #[test]
    fn prints_a_key_install_without_a_session() {
        let ctx = debug_context();
        let mut out = Vec::new();
        let mut dispatcher = debug_dispatcher(&ctx, &mut out);

        let info = CommandInfo {
            command: String::new(),
            location: Location::Remote,
            extra: Extra::CopySshKey(alice_key()),
        };
        assert!(dispatcher.run_remote(&info));
        drop(dispatcher);

        // Without a host to ask, the printout assumes the conventional home.
        assert_eq!(alice_key_steps("/home/alice"), printed_lines(out));
    }

    #[tokio::test]
    async fn prints_a_local_command_without_running_it() {
        let ctx = debug_context();
        let mut out = Vec::new();
        let mut dispatcher = debug_dispatcher(&ctx, &mut out);

        let info = CommandInfo {
            command: "sh -c 'exit 1'".to_string(),
            location: Location::Local,
            extra: Extra::None,
        };
        assert!(dispatcher.run_local(&info).await);
        drop(dispatcher);
        assert_eq!(vec!["sh -c 'exit 1'"], printed_lines(out));
    }
}

mod run_local {
    use super::*;

    fn local_dispatcher<'a>(
        ctx: &'a RunContext,
        out: &'a mut Vec<u8>,
    ) -> Dispatcher<'a, TestTransport, &'a mut Vec<u8>> {
        Dispatcher::new(ctx, &fixtures::connection_config(), None, out)
    }

    fn local(command: &str) -> CommandInfo {
        CommandInfo {
            command: command.to_string(),
            location: Location::Local,
            extra: Extra::None,
        }
    }

    #[tokio::test]
    async fn a_successful_command_passes() {
        let ctx = context();
        let mut out = Vec::new();
        let mut dispatcher = local_dispatcher(&ctx, &mut out);
        assert!(dispatcher.run_local(&local("sh -c 'exit 0'")).await);
    }

    #[tokio::test]
    async fn a_failing_command_is_reported() {
        let ctx = context();
        let mut out = Vec::new();
        let mut dispatcher = local_dispatcher(&ctx, &mut out);
        assert!(
            !dispatcher
                .run_local(&local("sh -c 'echo boom >&2; exit 1'"))
                .await
        );
        drop(dispatcher);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("Local command failed"));
        assert!(printed.contains("boom"));
    }

    #[tokio::test]
    async fn the_marker_in_stderr_counts_as_success() {
        let ctx = context();
        let mut out = Vec::new();
        let mut dispatcher = local_dispatcher(&ctx, &mut out);
        assert!(
            dispatcher
                .run_local(&local("sh -c 'echo already done >&2; exit 1'"))
                .await
        );
    }

    #[tokio::test]
    async fn unparseable_command_text_fails() {
        let ctx = context();
        let mut out = Vec::new();
        let mut dispatcher = local_dispatcher(&ctx, &mut out);
        assert!(!dispatcher.run_local(&local("echo 'unterminated")).await);
        assert!(!dispatcher.run_local(&local("")).await);
    }

    #[tokio::test]
    async fn a_timed_out_command_is_killed_and_partial_output_shown() {
        let mut ctx = context();
        ctx.local_timeout = Duration::from_millis(300);
        let mut out = Vec::new();
        let mut dispatcher = local_dispatcher(&ctx, &mut out);

        assert!(
            !dispatcher
                .run_local(&local("sh -c 'echo partial; sleep 10'"))
                .await
        );
        drop(dispatcher);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("timed out"));
        assert!(printed.contains("partial"));
    }
}
