use std::io::Write;
use std::time::Duration;

use serde_json::{json, Value};
use shrun_debugger::codec::{read_frame, write_frame};
use shrun_debugger::{DapError, DapServer};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    seq: i64,
}

impl Client {
    async fn send(&mut self, command: &str, arguments: Value) {
        self.seq += 1;
        let request = json!({
            "seq": self.seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        write_frame(&mut self.writer, &request).await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut self.reader))
            .await
            .expect("timed out waiting for a DAP message")
            .unwrap()
            .expect("server closed the stream");
        serde_json::from_slice(&frame).unwrap()
    }

    async fn response(&mut self, command: &str) -> Value {
        let message = self.next().await;
        assert_eq!(message["type"], "response", "{message}");
        assert_eq!(message["command"], command, "{message}");
        message
    }

    async fn event(&mut self, event: &str) -> Value {
        let message = self.next().await;
        assert_eq!(message["type"], "event", "{message}");
        assert_eq!(message["event"], event, "{message}");
        message
    }
}

fn start() -> (Client, JoinHandle<Result<(), DapError>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let handle = tokio::spawn(DapServer::default().run(server_read, server_write));
    let (reader, writer) = tokio::io::split(client);
    let client = Client {
        reader: BufReader::new(reader),
        writer,
        seq: 0,
    };
    (client, handle)
}

fn script(source: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

async fn launch(client: &mut Client, program: &tempfile::NamedTempFile, stop_on_entry: bool) {
    client
        .send(
            "launch",
            json!({ "program": program.path(), "stopOnEntry": stop_on_entry }),
        )
        .await;
    let response = client.response("launch").await;
    assert_eq!(response["success"], true, "{response}");
    client.event("initialized").await;
}

#[tokio::test]
async fn initialize_reports_capabilities() {
    let (mut client, server) = start();
    client.send("initialize", json!({ "adapterID": "shrun" })).await;
    let response = client.response("initialize").await;
    assert_eq!(response["success"], true);
    assert_eq!(response["request_seq"], 1);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);
    assert_eq!(response["body"]["supportsSetVariable"], false);

    client.send("disconnect", Value::Null).await;
    client.response("disconnect").await;
    client.event("terminated").await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn sequence_numbers_increase() {
    let (mut client, _server) = start();
    client.send("threads", Value::Null).await;
    let first = client.response("threads").await;
    client.send("threads", Value::Null).await;
    let second = client.response("threads").await;
    let first_seq = first["seq"].as_i64().unwrap();
    assert!(first_seq >= 1);
    assert_eq!(second["seq"].as_i64().unwrap(), first_seq + 1);
    assert_eq!(second["body"]["threads"][0]["name"], "main");
}

#[tokio::test]
async fn unknown_commands_fail() {
    let (mut client, _server) = start();
    client.send("evaluate", json!({ "expression": "x" })).await;
    let response = client.response("evaluate").await;
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "unsupported command evaluate");
}

#[tokio::test]
async fn launch_requires_a_program() {
    let (mut client, _server) = start();
    client.send("launch", json!({})).await;
    let response = client.response("launch").await;
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "program missing");
}

#[tokio::test]
async fn malformed_and_empty_messages_are_skipped() {
    let (mut client, _server) = start();
    client
        .writer
        .write_all(b"Content-Length: 8\r\n\r\nnot json")
        .await
        .unwrap();
    client.writer.write_all(b"Content-Length: 0\r\n\r\n").await.unwrap();
    client.send("threads", Value::Null).await;
    let response = client.response("threads").await;
    assert_eq!(response["success"], true);
}

#[tokio::test]
async fn runs_to_completion_with_output() {
    let program = script("Print hello\nPrint world\n");
    let (mut client, server) = start();
    launch(&mut client, &program, false).await;

    client.send("configurationDone", Value::Null).await;
    client.response("configurationDone").await;

    let first = client.event("output").await;
    assert_eq!(first["body"]["category"], "stdout");
    assert_eq!(first["body"]["output"], "hello\n");
    let second = client.event("output").await;
    assert_eq!(second["body"]["output"], "world\n");

    let terminated = client.event("terminated").await;
    assert_eq!(terminated["body"]["restart"], false);
    let exited = client.event("exited").await;
    assert_eq!(exited["body"]["exitCode"], 0);

    client.send("disconnect", Value::Null).await;
    client.response("disconnect").await;
    client.event("terminated").await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn breakpoints_stop_and_report_the_line() {
    let program = script("Print one\nPrint two\nPrint three\n");
    let (mut client, _server) = start();
    launch(&mut client, &program, false).await;

    client
        .send(
            "setBreakpoints",
            json!({
                "source": { "path": program.path() },
                "breakpoints": [{ "line": 0 }, { "line": 2 }],
            }),
        )
        .await;
    let response = client.response("setBreakpoints").await;
    assert_eq!(response["body"]["breakpoints"], json!([{ "verified": true, "line": 2 }]));

    client.send("configurationDone", Value::Null).await;
    client.response("configurationDone").await;
    assert_eq!(client.event("output").await["body"]["output"], "one\n");
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["line"], 2);

    client.send("stackTrace", json!({ "threadId": 1 })).await;
    let trace = client.response("stackTrace").await;
    let frame = &trace["body"]["stackFrames"][0];
    assert_eq!(frame["name"], "shrun");
    assert_eq!(frame["line"], 2);
    assert_eq!(frame["column"], 1);
    assert_eq!(frame["source"]["path"], program.path().display().to_string());

    client.send("next", json!({ "threadId": 1 })).await;
    client.response("next").await;
    assert_eq!(client.event("output").await["body"]["output"], "two\n");
    let stepped = client.event("stopped").await;
    assert_eq!(stepped["body"]["reason"], "step");
    assert_eq!(stepped["body"]["line"], 3);

    client.send("continue", json!({ "threadId": 1 })).await;
    let response = client.response("continue").await;
    assert_eq!(response["body"]["allThreadsContinued"], true);
    assert_eq!(client.event("output").await["body"]["output"], "three\n");
    client.event("terminated").await;
    client.event("exited").await;
}

#[tokio::test]
async fn stop_on_entry_reports_the_first_line() {
    let program = script("\n# header\nPrint one\n");
    let (mut client, _server) = start();
    launch(&mut client, &program, true).await;

    client.send("stackTrace", Value::Null).await;
    let trace = client.response("stackTrace").await;
    assert_eq!(trace["body"]["stackFrames"][0]["line"], 3);

    client.send("configurationDone", Value::Null).await;
    client.response("configurationDone").await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "entry");
    assert_eq!(stopped["body"]["line"], 3);

    client.send("scopes", json!({ "frameId": 1 })).await;
    let scopes = client.response("scopes").await;
    assert_eq!(scopes["body"]["scopes"][0]["name"], "Globals");
    assert_eq!(scopes["body"]["scopes"][0]["presentationHint"], "locals");
    client.send("variables", json!({ "variablesReference": 0 })).await;
    let variables = client.response("variables").await;
    assert_eq!(variables["body"]["variables"], json!([]));
}

#[tokio::test]
async fn failed_runs_report_on_stderr_and_terminate() {
    let program = script("Print one\nname=value\n");
    let (mut client, _server) = start();
    launch(&mut client, &program, false).await;

    client.send("configurationDone", Value::Null).await;
    client.response("configurationDone").await;
    client.event("output").await;
    let error = client.event("output").await;
    assert_eq!(error["body"]["category"], "stderr");
    assert!(error["body"]["output"]
        .as_str()
        .unwrap()
        .contains("unsupported node type: assignment"));
    let terminated = client.event("terminated").await;
    assert!(terminated.get("body").is_none());
}

#[tokio::test]
async fn command_errors_become_stderr_output() {
    let program = script("ToUpper\n");
    let (mut client, _server) = start();
    launch(&mut client, &program, false).await;

    client.send("configurationDone", Value::Null).await;
    client.response("configurationDone").await;
    let error = client.event("output").await;
    assert_eq!(error["body"]["category"], "stderr");
    assert!(error["body"]["output"].as_str().unwrap().ends_with('\n'));
    client.event("terminated").await;
    client.event("exited").await;
}

#[tokio::test]
async fn end_of_input_stops_the_server() {
    let (client, server) = start();
    drop(client);
    server.await.unwrap().unwrap();
}
