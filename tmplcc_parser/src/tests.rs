use crate::expr::{decode_escaped_string, Filter, Literal, Number, Operand, StringLit, Variable};
use crate::node::{CondKind, NodeKind, PartRole, ROOT};
use crate::scanner::{Scanner, TokenSink};
use crate::source::{SourceBuffer, SourceFile};
use crate::TemplateParser;

fn scanner(input: &str) -> Scanner {
    Scanner::new(vec![SourceFile::new("test.tmpl", input)])
}

fn wrap(body: &str) -> String {
    format!(
        "<% skin s %><% view v uses data::content %><% template render() %>{body}\
         <% end template %><% end view %><% end skin %>"
    )
}

fn parse(input: &str) -> TemplateParser {
    let mut parser = TemplateParser::new(vec![SourceFile::new("test.tmpl", input)]);
    parser.parse().unwrap();
    parser
}

fn parse_err(input: &str) -> String {
    let mut parser = TemplateParser::new(vec![SourceFile::new("test.tmpl", input)]);
    parser.parse().unwrap_err().message().to_string()
}

#[test]
fn test_source_buffer_concatenation() {
    let buffer = SourceBuffer::new(vec![
        SourceFile::new("a.tmpl", "x\ny"),
        SourceFile::new("b.tmpl", "z\n"),
    ]);
    // a missing trailing newline is appended
    assert_eq!(buffer.len(), 6);

    let mut buffer = buffer;
    assert_eq!(buffer.position().to_string(), "a.tmpl:1");
    buffer.move_to(2);
    assert_eq!(buffer.position().to_string(), "a.tmpl:2");
    buffer.move_to(4);
    assert_eq!(buffer.position().to_string(), "b.tmpl:1");
    buffer.move_to(2);
    assert_eq!(buffer.position().to_string(), "a.tmpl:2");
}

#[test]
fn test_source_buffer_marks() {
    let mut buffer = SourceBuffer::new(vec![SourceFile::new("a.tmpl", "hello world")]);
    buffer.mark();
    buffer.move_by(5);
    assert_eq!(buffer.get_mark(), 0);
    assert_eq!(buffer.take_from_mark(), "hello");
    assert_eq!(buffer.index(), 5);
}

#[test]
fn test_source_buffer_find() {
    let buffer = SourceBuffer::new(vec![SourceFile::new("a.tmpl", "abc <% def")]);
    assert_eq!(buffer.find_on_right("<%"), Some(4));
    assert_eq!(buffer.find_on_right("%>"), None);
    assert!(buffer.compare_head("abc"));
    assert!(!buffer.compare_head("abd"));
}

#[test]
fn test_try_token() {
    let mut p = scanner("foobar");
    assert!(p.try_token("foo").ok());
    assert!(p.try_token("bar").ok());
    assert!(!p.try_token("baz").ok());
    p.back(1);
    assert!(p.ok());
    // back over the matched tokens restores the index
    p.back(2);
    assert!(p.try_token("foobar").ok());
}

#[test]
fn test_try_one_of() {
    let mut p = scanner("->rest");
    let mut out = TokenSink::new();
    assert!(p.try_one_of(&[".", "->"], &mut out).ok());
    assert_eq!(out.value(), "->");
}

#[test]
fn test_try_name() {
    let mut p = scanner("abc1_x rest");
    let mut out = TokenSink::new();
    assert!(p.try_name(&mut out).ok());
    assert_eq!(out.value(), "abc1_x");

    let mut p = scanner("1abc");
    let mut out = TokenSink::new();
    assert!(!p.try_name(&mut out).ok());

    let mut p = scanner("_private");
    let mut out = TokenSink::new();
    assert!(p.try_name(&mut out).ok());
    assert_eq!(out.value(), "_private");
}

#[test]
fn test_try_string() {
    let mut p = scanner("\"a\\\"b\" tail");
    let mut out = TokenSink::new();
    assert!(p.try_string(&mut out).unwrap().ok());
    assert_eq!(out.value(), "\"a\\\"b\"");

    let mut p = scanner("no string");
    let mut out = TokenSink::new();
    assert!(!p.try_string(&mut out).unwrap().ok());
}

#[test]
fn test_unterminated_string_raises() {
    let mut p = scanner("\"abc");
    let mut out = TokenSink::new();
    let err = p.try_string(&mut out).unwrap_err();
    assert!(err.message().contains("found EOF instead"));
}

#[test]
fn test_try_number() {
    for (input, expected) in [
        ("123 rest", "123"),
        ("123.45x", "123.45"),
        ("-7,", "-7"),
        ("+3)", "+3"),
        ("0x1Fg", "0x1F"),
    ] {
        let mut p = scanner(input);
        let mut out = TokenSink::new();
        assert!(p.try_number(&mut out).ok(), "{input}");
        assert_eq!(out.value(), expected);
    }

    let mut p = scanner("xyz");
    let mut out = TokenSink::new();
    assert!(!p.try_number(&mut out).ok());
}

#[test]
fn test_try_variable() {
    for (input, expected) in [
        ("data->point.x rest", "data->point.x"),
        ("*foo.bar %>", "*foo.bar"),
        ("something.else() %>", "something.else()"),
        ("x[10].y %>", "x[10].y"),
        ("items[\"key\"] %>", "items[\"key\"]"),
        ("f(a, \"s\", 3) %>", "f(a, \"s\", 3)"),
    ] {
        let mut p = scanner(input);
        let mut out = TokenSink::new();
        assert!(p.try_variable(&mut out).unwrap().ok(), "{input}");
        assert_eq!(out.value(), expected);
    }
}

#[test]
fn test_try_complex_variable() {
    let mut p = scanner("a | upper | escape %>");
    let mut out = TokenSink::new();
    assert!(p.try_complex_variable(&mut out).unwrap().ok());
    assert_eq!(out.value(), "a | upper | escape");

    // the head variable is pushed last, filters below it in scan order
    let name = out.pop_detail().unwrap();
    assert_eq!(name.what, "complex_variable_name");
    assert_eq!(name.item, "a");
    let f2 = out.pop_detail().unwrap();
    assert_eq!((f2.what, f2.item.as_str()), ("complex_variable", "escape"));
    let f1 = out.pop_detail().unwrap();
    assert_eq!((f1.what, f1.item.as_str()), ("complex_variable", "upper"));
    assert!(!out.has_details());
}

#[test]
fn test_try_filter_ext() {
    let mut p = scanner("ext format_date(x) rest");
    p.push();
    let mut out = TokenSink::new();
    assert!(p.try_filter(&mut out).unwrap().ok());
    assert_eq!(out.value(), "ext format_date(x)");
    p.pop();
}

#[test]
fn test_try_identifier() {
    for (input, expected) in [
        ("data::page rest", "data::page"),
        ("name %>", "name"),
        ("list<data::user> x", "list<data::user>"),
        ("map<a::b,c>::iterator x", "map<a::b,c>::iterator"),
    ] {
        let mut p = scanner(input);
        let mut out = TokenSink::new();
        assert!(p.try_identifier(&mut out).unwrap().ok(), "{input}");
        assert_eq!(out.value(), expected);
    }
}

#[test]
fn test_try_param_list() {
    let mut p = scanner("( data::users const & users, int x ) %>");
    let mut out = TokenSink::new();
    assert!(p.try_param_list(&mut out).unwrap().ok());
    assert_eq!(out.value(), "( data::users const & users, int x )");

    // details pop newest-parameter first
    let mut params = Vec::new();
    let mut name = String::new();
    let mut ty = String::new();
    let mut is_const = false;
    let mut is_ref = false;
    while let Some(detail) = out.pop_detail() {
        match detail.what {
            "name" => name = detail.item,
            "type" => ty = detail.item,
            "is_const" => is_const = detail.item == "const",
            "is_ref" => is_ref = detail.item == "ref",
            "param_end" => params.push((ty.clone(), name.clone(), is_const, is_ref)),
            other => panic!("unexpected detail {other}"),
        }
    }
    assert_eq!(
        params,
        vec![
            ("int".to_string(), "x".to_string(), false, false),
            ("data::users".to_string(), "users".to_string(), true, true),
        ]
    );
}

#[test]
fn test_try_argument_list() {
    let mut p = scanner("(a, \"s\", -2) rest");
    let mut out = TokenSink::new();
    assert!(p.try_argument_list(&mut out).unwrap().ok());
    assert_eq!(out.value(), "(a, \"s\", -2)");
    let kinds: Vec<&str> = {
        let mut kinds = Vec::new();
        while let Some(detail) = out.pop_detail() {
            kinds.push(detail.what);
        }
        kinds
    };
    assert_eq!(
        kinds,
        vec!["argument_number", "argument_string", "argument_variable"]
    );

    // absent parentheses are fine, the match is just empty
    let mut p = scanner("rest");
    let mut out = TokenSink::new();
    assert!(p.try_argument_list(&mut out).unwrap().ok());
    assert_eq!(out.value(), "");
}

#[test]
fn test_try_parenthesis_expression() {
    let mut p = scanner("(a(b) \"x)\" 'y)') rest");
    let mut out = TokenSink::new();
    assert!(p.try_parenthesis_expression(&mut out).ok());
    assert_eq!(out.value(), "(a(b) \"x)\" 'y)')");

    let mut p = scanner("(unbalanced");
    let mut out = TokenSink::new();
    assert!(!p.try_parenthesis_expression(&mut out).ok());
}

#[test]
fn test_try_close_expression() {
    for input in ["%> x", "  %> x", "% > x"] {
        let mut p = scanner(input);
        assert!(p.try_close_expression().ok(), "{input}");
    }
    let mut p = scanner("%x");
    assert!(!p.try_close_expression().ok());
}

#[test]
fn test_skipws_require() {
    let mut p = scanner("  x");
    assert!(p.skipws(true).ok());
    assert!(!p.skipws(true).ok());
    p.back(1);
    assert!(p.skipws(false).ok());
}

#[test]
fn test_save_and_reset() {
    let mut p = scanner("abcdef");
    p.push();
    assert!(p.try_token("abc").ok());
    p.reset();
    assert!(p.try_token("abc").ok());
    p.pop();
}

#[test]
fn test_number_integer() {
    assert_eq!(Number::new("42").integer().unwrap(), 42);
    assert_eq!(Number::new("-7").integer().unwrap(), -7);
    assert_eq!(Number::new("0x1f").integer().unwrap(), 31);
    assert!(Number::new("1.5").integer().is_err());
}

#[test]
fn test_decode_escaped_string() {
    assert_eq!(decode_escaped_string("a\\n\\x41").unwrap(), b"a\nA".to_vec());
    // the octal marker digit is followed by the three value digits
    assert_eq!(decode_escaped_string("\\0101").unwrap(), b"A".to_vec());
    // escapes above 0x7f stay raw bytes
    assert_eq!(decode_escaped_string("\\xff").unwrap(), vec![0xff]);
    assert_eq!(decode_escaped_string("\\0377").unwrap(), vec![0xff]);
    assert_eq!(decode_escaped_string("plain").unwrap(), b"plain".to_vec());
    assert!(decode_escaped_string("\\xzz").is_err());
}

#[test]
fn test_string_lit_canonical_form() {
    // escapes in the source literal survive with their backslashes doubled,
    // raw control bytes become named escapes
    assert_eq!(StringLit::new("\"a\\nb\"").repr(), "\"a\\\\nb\"");
    assert_eq!(StringLit::new("\"a\\\"b\"").repr(), "\"a\\\"b\"");
    assert_eq!(StringLit::new("\"a\tb\"").repr(), "\"a\\tb\"");
}

#[test]
fn test_literal_compression() {
    assert_eq!(Literal::html("a\"b\n").value, "a\\\"b\\n");
    assert_eq!(Literal::text("back\\slash").value, "back\\\\slash");
}

#[test]
fn test_variable_parts() {
    let v = Variable::parse("data->point.x").unwrap();
    assert!(!v.is_deref);
    assert_eq!(v.parts.len(), 3);
    assert_eq!(v.parts[0].name, "data");
    assert_eq!(v.parts[0].separator, "->");
    assert_eq!(v.parts[1].name, "point");
    assert_eq!(v.parts[1].separator, ".");
    assert_eq!(v.parts[2].name, "x");
    assert_eq!(v.parts[2].separator, "");

    let v = Variable::parse("*handle").unwrap();
    assert!(v.is_deref);

    let v = Variable::parse("f(a, 3)").unwrap();
    assert!(v.parts[0].is_function);
    assert_eq!(v.parts[0].arguments.len(), 2);
    assert!(matches!(v.parts[0].arguments[1], Operand::Num(_)));

    assert!(Variable::parse("a b").is_err());
}

#[test]
fn test_filter_parse() {
    let filter = Filter::parse("upper").unwrap();
    assert!(!filter.ext);
    assert_eq!(filter.call.head, "upper");

    let filter = Filter::parse("ext my_fmt(x)").unwrap();
    assert!(filter.ext);
    assert_eq!(filter.call.head, "my_fmt");
    assert_eq!(filter.call.arguments.len(), 1);
}

#[test]
fn test_parse_minimal_skin() {
    let parser = parse(
        "<% skin %><% view x uses data::t %><% template render() %>Hello\
         <% end template %><% end view %><% end skin %>",
    );
    let ast = parser.ast();
    let root = ast.root();
    assert_eq!(root.skins.len(), 1);
    assert_eq!(root.skins[0].name.repr(), "__default__");
    assert!(root.current_skin.is_none(), "skin should be closed");
    assert_eq!(root.skins[0].views.len(), 1);

    let view = root.skins[0].views[0];
    let NodeKind::View(view) = &ast.node(view).kind else {
        panic!("expected a view");
    };
    assert_eq!(view.name.repr(), "x");
    assert_eq!(view.data.repr(), "data::t");
    assert!(view.master.is_none());
    assert_eq!(view.templates.len(), 1);

    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    assert_eq!(template.name.repr(), "render");
    assert_eq!(template.params.repr(), "()");
    assert_eq!(template.children.len(), 1);
    let NodeKind::Text(text) = &ast.node(template.children[0]).kind else {
        panic!("expected a text node");
    };
    assert_eq!(text.value.value, "Hello");
}

#[test]
fn test_parse_named_skin_and_extends() {
    let parser = parse(
        "<% skin admin %><% view x uses data::t extends base %>\
         <% template render() %><% end template %><% end view %><% end skin %>",
    );
    let ast = parser.ast();
    let root = ast.root();
    assert_eq!(root.skins[0].name.repr(), "admin");
    let NodeKind::View(view) = &ast.node(root.skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    assert_eq!(view.master.as_ref().unwrap().repr(), "base");
}

#[test]
fn test_parse_variable_with_filters() {
    let parser = parse(&wrap("<%= name | upper | escape %>"));
    let ast = parser.ast();
    let root = ast.root();
    let NodeKind::View(view) = &ast.node(root.skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::VariableEmit(emit) = &ast.node(template.children[0]).kind else {
        panic!("expected a variable node");
    };
    assert_eq!(emit.variable.repr(), "name");
    let names: Vec<&str> = emit.filters.iter().map(|f| f.call.head.as_str()).collect();
    assert_eq!(names, vec!["upper", "escape"]);
}

#[test]
fn test_parse_deprecated_variable_syntax() {
    let parser = parse(&wrap("<% name %>"));
    let ast = parser.ast();
    let root = ast.root();
    let NodeKind::View(view) = &ast.node(root.skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    assert!(matches!(
        ast.node(template.children[0]).kind,
        NodeKind::VariableEmit(_)
    ));
}

#[test]
fn test_parse_if_chain() {
    let parser = parse(&wrap(
        "<% if not empty a and empty b or c %>x<% elif rtl %>y<% else %>z<% end if %>",
    ));
    let ast = parser.ast();
    let root = ast.root();
    let NodeKind::View(view) = &ast.node(root.skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::If(if_node) = &ast.node(template.children[0]).kind else {
        panic!("expected an if node");
    };
    assert_eq!(if_node.conditions.len(), 3);

    let NodeKind::Condition(first) = &ast.node(if_node.conditions[0]).kind else {
        panic!("expected a condition");
    };
    assert_eq!(first.kind, CondKind::Empty);
    assert!(first.negate);
    assert_eq!(first.chain.len(), 2);
    assert_eq!(first.chain[0].kind, CondKind::Empty);
    assert_eq!(first.chain[1].kind, CondKind::Regular);

    let NodeKind::Condition(second) = &ast.node(if_node.conditions[1]).kind else {
        panic!("expected a condition");
    };
    assert_eq!(second.kind, CondKind::Rtl);

    let NodeKind::Condition(third) = &ast.node(if_node.conditions[2]).kind else {
        panic!("expected a condition");
    };
    assert_eq!(third.kind, CondKind::Else);
}

#[test]
fn test_cpp_condition_does_not_chain() {
    let err = parse_err(&wrap("<% if (x > 1) and y %>x<% end if %>"));
    assert!(err.contains("expected %>"), "{err}");
}

#[test]
fn test_parse_foreach_parts() {
    let parser = parse(&wrap(
        "<% foreach x rowid r from 2 reverse in items %>p\
         <% item %><%= x %><% end item %>s\
         <% separator %>,<% end foreach %>",
    ));
    let ast = parser.ast();
    let root = ast.root();
    let NodeKind::View(view) = &ast.node(root.skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::Foreach(foreach) = &ast.node(template.children[0]).kind else {
        panic!("expected a foreach node");
    };
    assert_eq!(foreach.item.repr(), "x");
    assert_eq!(foreach.rowid.as_ref().unwrap().repr(), "r");
    assert_eq!(foreach.from, 2);
    assert!(foreach.reverse);
    assert_eq!(foreach.array.repr(), "items");
    assert!(foreach.prefix.is_some());
    assert!(foreach.item_part.is_some());
    assert!(foreach.suffix.is_some());
    assert!(foreach.separator.is_some());
    assert!(foreach.empty.is_none());

    let NodeKind::ForeachPart(part) = &ast.node(foreach.item_part.unwrap()).kind else {
        panic!("expected a part");
    };
    assert_eq!(part.role, PartRole::Item);
    assert_eq!(part.children.len(), 1);
}

#[test]
fn test_foreach_without_item_rejected() {
    let err = parse_err(&wrap("<% foreach x in items %><% end foreach %>"));
    assert!(err.contains("foreach without <% item %>"), "{err}");
}

#[test]
fn test_parse_cache_and_trigger() {
    let parser = parse(&wrap(
        "<% cache \"k\" for 60 on miss update() no recording %>\
         <% trigger \"t1\" %>x<% end cache %>",
    ));
    let ast = parser.ast();
    let root = ast.root();
    let NodeKind::View(view) = &ast.node(root.skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::Cache(cache) = &ast.node(template.children[0]).kind else {
        panic!("expected a cache node");
    };
    assert_eq!(cache.duration, 60);
    assert_eq!(cache.miss.as_ref().unwrap().repr(), "update()");
    assert!(!cache.recording);
    assert!(cache.triggers);
    assert_eq!(cache.trigger_list.len(), 1);
}

#[test]
fn test_trigger_outside_cache_rejected() {
    let err = parse_err(&wrap("<% trigger \"t\" %>"));
    assert!(err.contains("could not insert child node"), "{err}");
    assert!(err.contains("cache"), "{err}");
}

#[test]
fn test_else_without_if_rejected() {
    let err = parse_err(&wrap("<% else %>"));
    assert!(err.contains("unexpected else found"), "{err}");
}

#[test]
fn test_if_with_only_else_rejected() {
    // an else cannot open an if chain
    let err = parse_err(&wrap("<% else %>x<% end if %>"));
    assert!(err.contains("unexpected else found"), "{err}");
}

#[test]
fn test_end_name_mismatch() {
    let err = parse_err(&wrap("<% if x %>y<% end foreach %>"));
    assert!(err.contains("expected 'end if', not 'end foreach'"), "{err}");
}

#[test]
fn test_unclosed_cache_rejected() {
    let err = parse_err(&wrap("<% cache \"k\" %>x"));
    assert!(err.contains("expected 'end cache', not 'end template'"), "{err}");
}

#[test]
fn test_stray_close_tag_rejected() {
    let err = parse_err(&wrap("a %> b"));
    assert!(err.contains("unexpected %>"), "{err}");
}

#[test]
fn test_view_outside_skin_rejected() {
    let err = parse_err("<% view x uses data::t %>");
    assert!(err.contains("view must be inside skin"), "{err}");
}

#[test]
fn test_text_outside_template_rejected() {
    let err = parse_err("<% skin s %>hello<% end skin %>");
    assert!(err.contains("could not insert child node"), "{err}");
    assert!(err.contains("maybe you forgot about <% end %>?"), "{err}");
}

#[test]
fn test_whitespace_between_directives_is_dropped() {
    let parser = parse(
        "<% skin s %>\n  <% view v uses data::c %>\n<% template render() %>\
         <% end template %><% end view %><% end skin %>\n",
    );
    let ast = parser.ast();
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    assert!(template.children.is_empty());
}

#[test]
fn test_parse_render_and_using_options() {
    let parser = parse(&wrap(
        "<% gt \"hi {1}\" using a | upper, b %>\
         <% ngt \"one\", \"many\", n %>\
         <% url \"/go\" using q %>\
         <% include helper(x) %>\
         <% csrf token %>\
         <% render \"other\", \"page\" with sub %>\
         <% form as_p f %>",
    ));
    let ast = parser.ast();
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    assert_eq!(template.children.len(), 7);

    let NodeKind::FmtFunction(gt) = &ast.node(template.children[0]).kind else {
        panic!("expected gt");
    };
    assert_eq!(gt.options.len(), 2);
    assert_eq!(gt.options[0].filters.len(), 1);
    assert_eq!(gt.options[0].filters[0].call.head, "upper");
    assert_eq!(gt.options[1].variable.repr(), "b");

    assert!(matches!(ast.node(template.children[1]).kind, NodeKind::Ngt(_)));
    assert!(matches!(
        ast.node(template.children[2]).kind,
        NodeKind::FmtFunction(_)
    ));
    let NodeKind::Include(include) = &ast.node(template.children[3]).kind else {
        panic!("expected include");
    };
    assert_eq!(include.call.head, "helper");
    let NodeKind::Csrf(csrf) = &ast.node(template.children[4]).kind else {
        panic!("expected csrf");
    };
    assert_eq!(csrf.style.as_ref().unwrap().repr(), "token");
    let NodeKind::Render(render) = &ast.node(template.children[5]).kind else {
        panic!("expected render");
    };
    assert!(render.skin.is_some());
    assert_eq!(render.with.as_ref().unwrap().repr(), "sub");
    assert!(matches!(ast.node(template.children[6]).kind, NodeKind::Form(_)));
}

#[test]
fn test_parse_form_block_and_end_sentinel() {
    let parser = parse(&wrap("<% form begin f %>inner<% form end f %>"));
    let ast = parser.ast();
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::Form(form) = &ast.node(template.children[0]).kind else {
        panic!("expected form");
    };
    assert_eq!(form.style.repr(), "begin");
    assert_eq!(form.children.len(), 1);
}

#[test]
fn test_parse_using_block_scopes() {
    let parser = parse(&wrap(
        "<% using ns::helper with sub as hv %>x<% end using %>",
    ));
    let ast = parser.ast();
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::Using(using) = &ast.node(template.children[0]).kind else {
        panic!("expected using");
    };
    assert_eq!(using.id.repr(), "ns::helper");
    assert_eq!(using.as_id.repr(), "hv");
    assert_eq!(using.with.as_ref().unwrap().repr(), "sub");
    assert_eq!(using.children.len(), 1);
}

#[test]
fn test_parse_cpp_blocks() {
    let parser = parse(
        "<% c++ #include \"data.h\" %><% skin s %><% view v uses data::c %>\
         <% template render() %><% c++ int x = 0; %><% end template %>\
         <% end view %><% end skin %>",
    );
    let ast = parser.ast();
    assert_eq!(ast.root().codes.len(), 1);
    assert_eq!(ast.root().codes[0].code.value, "#include \"data.h\" ");
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    assert!(matches!(
        ast.node(template.children[0]).kind,
        NodeKind::CppCode(_)
    ));
}

#[test]
fn test_output_mode_directive() {
    let parser = parse(
        "<% xhtml %><% skin s %><% view v uses data::c %><% template render() %>a\
         <% end template %><% end view %><% end skin %>",
    );
    let ast = parser.ast();
    assert_eq!(ast.mode(), Some(crate::expr::OutputMode::Xhtml));
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::Text(text) = &ast.node(template.children[0]).kind else {
        panic!("expected text");
    };
    assert_eq!(text.value.kind, crate::expr::OutputMode::Xhtml);
}

#[test]
fn test_template_with_parameters_and_type_args() {
    let parser = parse(
        "<% skin s %><% view v uses data::c %>\
         <% template show<T>(T const & value, int n) %><% end template %>\
         <% end view %><% end skin %>",
    );
    let ast = parser.ast();
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    assert_eq!(template.template_args.len(), 1);
    assert_eq!(template.template_args[0].repr(), "T");
    assert_eq!(template.params.params.len(), 2);
    let names: Vec<&str> = template
        .params
        .params
        .iter()
        .map(|p| p.name.repr())
        .collect();
    // parameter details are decoded newest-first
    assert_eq!(names, vec!["n", "value"]);
}

#[test]
fn test_end_with_name_returns_parent() {
    // `end <sysname>` pops exactly one level at a time
    let parser = parse(
        "<% skin s %><% view v uses data::c %><% template render() %>\
         <% if x %>a<% end if %><% end template %><% end view %><% end skin %>",
    );
    let ast = parser.ast();
    // parent chain from the deepest node reaches the root
    let NodeKind::View(view) = &ast.node(ast.root().skins[0].views[0]).kind else {
        panic!("expected a view");
    };
    let NodeKind::Template(template) = &ast.node(view.templates[0]).kind else {
        panic!("expected a template");
    };
    let NodeKind::If(if_node) = &ast.node(template.children[0]).kind else {
        panic!("expected if");
    };
    let mut node = if_node.conditions[0];
    let mut steps = 0;
    while let Some(parent) = ast.parent(node) {
        node = parent;
        steps += 1;
        assert!(steps < 16, "parent chain must terminate");
    }
    assert_eq!(node, ROOT);
}

#[test]
fn test_ast_dump_round_trip_shape() {
    let source = wrap("<%= name | upper %><% if empty a %>x<% end if %>");
    let parser = parse(&source);
    let dump = parser.ast().dump();
    assert!(dump.contains("view [name:v] uses [id:data::content]"), "{dump}");
    assert!(dump.contains("template [name:render]"), "{dump}");
    assert!(dump.contains("[filter:upper()]"), "{dump}");
    assert!(dump.contains("if with 1 branches ["), "{dump}");
}
