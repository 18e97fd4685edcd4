//! Upstream DSL: `proto://host,weight proto://host,weight ...`.

use crate::error::{Error, Result};
use crate::upstream::{Protocol, Selection, Server, Upstream};

pub fn parse_upstream(input: &str) -> Result<Upstream> {
    let mut selections = Vec::new();
    for token in input.split_whitespace() {
        selections.push(parse_selection(token)?);
    }
    if selections.is_empty() {
        return Err(Error::Parse {
            pos: 0,
            message: "upstream must have at least one selection".into(),
        });
    }
    Ok(Upstream::new(selections))
}

fn parse_selection(token: &str) -> Result<Selection> {
    let (server_part, weight) = match token.rsplit_once(',') {
        Some((s, w)) => {
            let weight: u32 = w.parse().map_err(|_| Error::Parse {
                pos: 0,
                message: format!("invalid weight '{w}' in selection '{token}'"),
            })?;
            (s, weight)
        }
        None => (token, 1),
    };
    let server = parse_server(server_part)?;
    Ok(Selection { server, weight })
}

fn parse_server(token: &str) -> Result<Server> {
    if let Some(rest) = token.strip_prefix("https://") {
        return Ok(Server {
            protocol: Protocol::Https,
            location: rest.to_string(),
        });
    }
    if let Some(rest) = token.strip_prefix("http://") {
        return Ok(Server {
            protocol: Protocol::Http,
            location: rest.to_string(),
        });
    }
    if token.is_empty() {
        return Err(Error::Parse {
            pos: 0,
            message: "empty server location".into(),
        });
    }
    Ok(Server {
        protocol: Protocol::Http,
        location: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_selection_defaults() {
        let up = parse_upstream("prod").unwrap();
        assert_eq!(up.selections().len(), 1);
        assert_eq!(up.selections()[0].server.protocol, Protocol::Http);
        assert_eq!(up.selections()[0].weight, 1);
    }

    #[test]
    fn parses_weighted_multi_selection() {
        let up = parse_upstream("http://a,1 http://b,3").unwrap();
        assert_eq!(up.total(), 4);
        assert!(!up.uniform());
    }

    #[test]
    fn print_round_trips() {
        let up = parse_upstream("http://a,1 https://b,3").unwrap();
        assert_eq!(up.to_string(), "http://a,1 https://b,3");
    }

    #[test]
    fn rejects_empty_upstream() {
        assert!(parse_upstream("   ").is_err());
    }
}
