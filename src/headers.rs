/// Message headers in arrival order. Names may repeat; lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value recorded for `name`.
    pub fn get<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[test]
fn test_headers_multimap() {
    let mut headers = Headers::new();
    headers.add("Received", "from a");
    headers.add("Subject", "hello");
    headers.add("received", "from b");
    assert_eq!(headers.len(), 3);
    assert_eq!(headers.get("SUBJECT"), Some("hello"));
    assert_eq!(
        headers.get_all("Received").collect::<Vec<_>>(),
        ["from a", "from b"]
    );
    assert_eq!(headers.get("X-Missing"), None);

    // values outlive the name they were looked up with
    let subject = {
        let name = String::from("subject");
        headers.get(&name)
    };
    assert_eq!(subject, Some("hello"));
    assert_eq!(
        headers.iter().map(|(n, _)| n).collect::<Vec<_>>(),
        ["Received", "Subject", "received"]
    );
}
