use std::collections::BTreeMap;

use crate::jumper::api::ForwardDataSet;

/// Produces a ready-to-paste client command for a service reachable at a
/// tunnel's local address. Implementations are selected by sniffing the
/// credential `uri` scheme.
pub trait ConnectionPrinter {
    /// An empty string means "no sample command for this service".
    fn sample_call(&self, local_addr: &str) -> String;
}

pub fn select_printer(credentials: &BTreeMap<String, String>) -> Box<dyn ConnectionPrinter> {
    let uri = credentials.get("uri").map(String::as_str).unwrap_or("");
    if uri.starts_with("mongodb://") {
        Box::new(MongodbConnectionPrinter {
            credentials: credentials.clone(),
        })
    } else if uri.starts_with("postgres://") {
        Box::new(PostgresConnectionPrinter {
            credentials: credentials.clone(),
        })
    } else if uri.starts_with("amqp://") {
        Box::new(RabbitMqConnectionPrinter)
    } else {
        Box::new(DefaultConnectionPrinter)
    }
}

pub struct DefaultConnectionPrinter;

impl ConnectionPrinter for DefaultConnectionPrinter {
    fn sample_call(&self, local_addr: &str) -> String {
        format!("No sample call to connect to service on {local_addr} available.")
    }
}

pub struct MongodbConnectionPrinter {
    credentials: BTreeMap<String, String>,
}

impl ConnectionPrinter for MongodbConnectionPrinter {
    fn sample_call(&self, local_addr: &str) -> String {
        format!(
            "mongo {local_addr}/{} -u {} -p {}",
            cred(&self.credentials, "default_database"),
            cred(&self.credentials, "username"),
            cred(&self.credentials, "password"),
        )
    }
}

pub struct PostgresConnectionPrinter {
    credentials: BTreeMap<String, String>,
}

impl ConnectionPrinter for PostgresConnectionPrinter {
    fn sample_call(&self, local_addr: &str) -> String {
        let (host, port) = local_addr.rsplit_once(':').unwrap_or((local_addr, ""));
        format!(
            "PGPASSWORD={} psql -h {host} -U {} -p {port} {}",
            cred(&self.credentials, "password"),
            cred(&self.credentials, "username"),
            cred(&self.credentials, "name"),
        )
    }
}

/// No sample: there is no rabbitmq command-line client worth suggesting.
pub struct RabbitMqConnectionPrinter;

impl ConnectionPrinter for RabbitMqConnectionPrinter {
    fn sample_call(&self, _local_addr: &str) -> String {
        String::new()
    }
}

fn cred<'a>(credentials: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    credentials.get(key).map(String::as_str).unwrap_or("")
}

/// Credentials the user needs to type; connection coordinates are replaced by
/// the tunnel's local address and would only mislead.
pub fn printable_credentials(
    credentials: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    credentials
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "uri" | "host" | "port"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

pub fn print_credentials(credentials: &BTreeMap<String, String>) {
    let printable = printable_credentials(credentials);
    if printable.is_empty() {
        return;
    }
    println!("\nCredentials:");
    for (key, value) in printable {
        println!("{key}: {value}");
    }
    println!();
}

pub fn print_sample_cmds(sample_cmds: &[String]) {
    if sample_cmds.is_empty() {
        return;
    }
    println!("\nYou can connect to the service using the following command(s):");
    for cmd in sample_cmds {
        println!("{cmd}");
    }
}

pub fn print_forwards(forwards: &[ForwardDataSet]) {
    println!("{:<12} HOSTS", "ID");
    for forward in forwards {
        println!("{:<12} {}", forward.id, forward.hosts.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn postgres_sample_call() {
        let printer = PostgresConnectionPrinter {
            credentials: creds(&[
                ("username", "the_username"),
                ("password", "the_password"),
                ("name", "databasename"),
            ]),
        };
        assert_eq!(
            printer.sample_call("localhost:12345"),
            "PGPASSWORD=the_password psql -h localhost -U the_username -p 12345 databasename"
        );
    }

    #[test]
    fn mongodb_sample_call() {
        let printer = MongodbConnectionPrinter {
            credentials: creds(&[
                ("username", "the_username"),
                ("password", "the_password"),
                ("default_database", "databasename"),
            ]),
        };
        assert_eq!(
            printer.sample_call("localhost:56789"),
            "mongo localhost:56789/databasename -u the_username -p the_password"
        );
    }

    #[test]
    fn printer_selection_follows_the_uri_scheme() {
        let p = select_printer(&creds(&[("uri", "postgres://u:p@host/db")]));
        assert!(p.sample_call("h:1").starts_with("PGPASSWORD="));

        let p = select_printer(&creds(&[("uri", "mongodb://u:p@host/db")]));
        assert!(p.sample_call("h:1").starts_with("mongo "));

        let p = select_printer(&creds(&[("uri", "amqp://u:p@host")]));
        assert_eq!(p.sample_call("h:1"), "");

        let p = select_printer(&creds(&[("uri", "mysql://u:p@host/db")]));
        assert!(p.sample_call("h:1").contains("No sample call"));

        let p = select_printer(&creds(&[]));
        assert!(p.sample_call("h:1").contains("No sample call"));
    }

    #[test]
    fn printable_credentials_hide_connection_coordinates() {
        let all = creds(&[
            ("uri", "postgres://u:p@host/db"),
            ("host", "10.0.0.1"),
            ("port", "5432"),
            ("username", "u"),
            ("password", "p"),
        ]);
        let printable = printable_credentials(&all);
        let keys: Vec<&str> = printable.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["password", "username"]);
    }
}
