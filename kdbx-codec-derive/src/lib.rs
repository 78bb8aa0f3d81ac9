//! Derive macros mapping plain structs onto KeePass XML elements
//!
//! Every named field becomes a child element whose name is the field name in
//! PascalCase unless overridden with `#[kdbx(element = "Name")]`. The field
//! type selects the layout:
//!
//! * `T` and `Option<T>`: `<Field>..</Field>`
//! * `Vec<T>`: `<Field><T>..</T><T>..</T></Field>`
//! * `Option<Vec<T>>`: same as `Vec<T>`, but the wrapper may be absent
//! * `#[kdbx(flatten)] Vec<T>`: repeated `<Field>..</Field>` siblings
//!
//! The generated code relies on `crate::xml_codec` of the deriving crate.

use proc_macro::TokenStream as TS1;
use proc_macro2::{token_stream::IntoIter, Ident, Span, TokenStream, TokenTree};

use quote::{format_ident, quote};

use change_case::pascal_case;
use syn::{Attribute, Error, PathSegment, Type};

#[derive(Debug)]
struct KdbxField {
    name: Ident,
    r#type: Ident,
    element_name: String,
    inner_type: Type,
    full_type: Type,
    array: bool,
    option: bool,
    flatten: bool,
}

struct KdbxAttributes {
    element_name: Option<String>,
    flatten: bool,
}

fn get_value(tokens: &mut IntoIter) -> Option<String> {
    if let (Some(TokenTree::Punct(symbol)), Some(TokenTree::Literal(value))) =
        (tokens.next(), tokens.next())
    {
        if symbol.as_char() == '=' {
            Some(value.to_string().replace('"', ""))
        } else {
            None
        }
    } else {
        None
    }
}

impl KdbxAttributes {
    fn parse(attrs: &[Attribute]) -> Result<Self, Error> {
        let mut element_name = None;
        let mut flatten = false;
        for attr in attrs
            .iter()
            .filter(|a| a.path().is_ident("kdbx"))
            .filter_map(|a| match a.meta {
                syn::Meta::List(ref v) => Some(&v.tokens),
                _ => None,
            })
        {
            let mut attr_token = attr.clone().into_iter();
            while let Some(item) = attr_token.next() {
                if let TokenTree::Ident(name) = item {
                    match name.to_string().as_str() {
                        "element" => {
                            element_name = Some(get_value(&mut attr_token).ok_or_else(|| {
                                Error::new(name.span(), "Expected element = \"Name\"")
                            })?);
                        }
                        "flatten" => {
                            flatten = true;
                        }
                        _ => {
                            return Err(Error::new(name.span(), "Unrecognized attribute"));
                        }
                    }
                }
            }
        }
        Ok(Self {
            element_name,
            flatten,
        })
    }
}

enum TypeCategory<'a> {
    Basic(Ident),
    Option(&'a Type),
    Vec(&'a Type),
    Array,
}

fn type_argument(segment: &PathSegment) -> Result<&Type, Error> {
    if let syn::PathArguments::AngleBracketed(ref args) = segment.arguments {
        if let Some(syn::GenericArgument::Type(inner_type)) = args.args.first() {
            return Ok(inner_type);
        }
    }
    Err(Error::new(
        segment.ident.span(),
        format!("Expected a type argument for {}<_>", segment.ident),
    ))
}

fn get_type(t: &Type) -> Result<TypeCategory, Error> {
    match t {
        syn::Type::Path(ref p) => {
            let segment = p
                .path
                .segments
                .last()
                .ok_or_else(|| Error::new(Span::call_site(), "Empty type path"))?;
            match segment.ident.to_string().as_str() {
                "Vec" => {
                    let inner_type = type_argument(segment)?;
                    match get_type(inner_type)? {
                        // Byte vectors are a single base64 value, not a list
                        TypeCategory::Basic(ref ident) if ident == "u8" => {
                            Ok(TypeCategory::Basic(ident.clone()))
                        }
                        _ => Ok(TypeCategory::Vec(inner_type)),
                    }
                }
                "Option" => Ok(TypeCategory::Option(type_argument(segment)?)),
                _ => Ok(TypeCategory::Basic(segment.ident.clone())),
            }
        }
        syn::Type::Array(_) => Ok(TypeCategory::Array),
        _ => Err(Error::new(Span::call_site(), "Unsupported field type")),
    }
}

fn list_item(inner_type: &Type) -> Result<Ident, Error> {
    match get_type(inner_type)? {
        TypeCategory::Basic(t) => Ok(t),
        _ => Err(Error::new(
            Span::call_site(),
            "Only basic types are supported inside Vec<_>",
        )),
    }
}

fn decode_field(field: &syn::Field) -> Result<KdbxField, Error> {
    let name = field
        .ident
        .clone()
        .ok_or_else(|| Error::new(Span::call_site(), "Only named fields are supported"))?;
    let attrs = KdbxAttributes::parse(&field.attrs)?;
    let element_name = attrs
        .element_name
        .clone()
        .unwrap_or_else(|| pascal_case(&name.to_string()));
    let flatten = attrs.flatten;
    let byte = || Ident::new("u8", Span::call_site());
    let (r#type, inner_type, array, option) = match get_type(&field.ty)? {
        TypeCategory::Basic(t) => (t, field.ty.clone(), false, false),
        TypeCategory::Array => (byte(), field.ty.clone(), false, false),
        TypeCategory::Vec(inner_type) => (list_item(inner_type)?, inner_type.clone(), true, false),
        TypeCategory::Option(inner_type) => match get_type(inner_type)? {
            TypeCategory::Basic(t) => (t, inner_type.clone(), false, true),
            TypeCategory::Array => (byte(), inner_type.clone(), false, true),
            TypeCategory::Vec(item) => (list_item(item)?, item.clone(), true, true),
            TypeCategory::Option(_) => {
                return Err(Error::new(name.span(), "Nested Option<Option<_>> is not supported"));
            }
        },
    };
    if flatten && (!array || option) {
        return Err(Error::new(name.span(), "flatten only applies to Vec<_> fields"));
    }
    Ok(KdbxField {
        name,
        r#type,
        element_name,
        inner_type,
        full_type: field.ty.clone(),
        array,
        option,
        flatten,
    })
}

fn decode_struct(ast: &syn::DeriveInput) -> Result<Vec<KdbxField>, Error> {
    match ast.data {
        syn::Data::Struct(ref data_struct) => data_struct.fields.iter().map(decode_field).collect(),
        _ => Err(Error::new(
            ast.ident.span(),
            "Only structs currently supported for derive",
        )),
    }
}

#[proc_macro_derive(KdbxParse, attributes(kdbx))]
pub fn derive_deserializer(input: TS1) -> TS1 {
    derive_deserializer2(input.into()).into()
}

fn derive_deserializer2(input: TokenStream) -> TokenStream {
    let ast: syn::DeriveInput = match syn::parse2(input) {
        Ok(v) => v,
        Err(e) => {
            return e.into_compile_error();
        }
    };
    let outer_type = &ast.ident;

    let fields = match decode_struct(&ast) {
        Ok(v) => v,
        Err(e) => {
            return e.into_compile_error();
        }
    };
    let variables: TokenStream = fields
        .iter()
        .map(|r| {
            let mangled_name = format_ident!("field_{}", r.name);
            let full_type = &r.full_type;
            quote! { let mut #mangled_name = <#full_type as ::std::default::Default>::default(); }
        })
        .collect();
    let elements: TokenStream = fields
        .iter()
        .map(|r| {
            let mangled_name = format_ident!("field_{}", r.name);
            let inner_type = &r.inner_type;
            let big_name = &r.element_name;
            let item_name = r.r#type.to_string();
            let parse_one = quote! {
                <#inner_type as KdbxParse<KdbxContext>>::parse(reader, child, attributes, context)?
            };
            let assign = match (r.array, r.option, r.flatten) {
                (true, _, true) => quote! { #mangled_name.push(#parse_one.unwrap_or_default()); },
                (true, true, false) => quote! {
                    #mangled_name = Some(crate::xml_codec::parse_list(reader, child, #item_name, context)?);
                },
                (true, false, false) => quote! {
                    #mangled_name = crate::xml_codec::parse_list(reader, child, #item_name, context)?;
                },
                (false, true, _) => quote! { #mangled_name = #parse_one; },
                (false, false, _) => quote! { #mangled_name = #parse_one.unwrap_or_default(); },
            };
            quote! {
                XmlEvent::StartElement { name: child, attributes, .. } if child.local_name == #big_name => {
                    let _ = &attributes;
                    #assign
                }
            }
        })
        .collect();
    let names = fields.iter().map(|r| {
        let name = &r.name;
        let mangled_name = format_ident!("field_{}", name);
        quote! { #name: #mangled_name }
    });
    quote! {
        impl crate::xml_codec::KdbxParse<crate::xml_codec::KdbxContext> for #outer_type {
            fn parse<R: ::std::io::Read>(
                reader: &mut ::xml::reader::EventReader<R>,
                name: ::xml::name::OwnedName,
                _attributes: ::std::vec::Vec<::xml::attribute::OwnedAttribute>,
                context: &mut crate::xml_codec::KdbxContext,
            ) -> ::std::result::Result<::std::option::Option<Self>, ::std::string::String> {
                use ::xml::reader::XmlEvent;
                use crate::xml_codec::{KdbxContext, KdbxParse};

                #variables
                loop {
                    match reader.next().map_err(|e| format!("Malformed XML document: {}", e))? {
                        XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => {
                            return Err(format!("Malformed XML document inside <{}>", name));
                        }
                        #elements
                        XmlEvent::StartElement { .. } => {
                            reader.skip().map_err(|e| format!("Malformed XML document: {}", e))?;
                        }
                        XmlEvent::EndElement { name: end } => {
                            if end != name {
                                return Err(format!("Start tag <{}> mismatches end tag </{}>", name, end));
                            }
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(Some(#outer_type {
                    #(#names),*
                }))
            }
        }
    }
}

#[proc_macro_derive(KdbxSerialize, attributes(kdbx))]
pub fn derive_serializer(input: TS1) -> TS1 {
    derive_serializer2(input.into()).into()
}

fn derive_serializer2(input: TokenStream) -> TokenStream {
    let ast: syn::DeriveInput = match syn::parse2(input) {
        Ok(v) => v,
        Err(e) => {
            return e.into_compile_error();
        }
    };
    let outer_type = &ast.ident;

    let fields = match decode_struct(&ast) {
        Ok(v) => v,
        Err(e) => {
            return e.into_compile_error();
        }
    };
    let elements: TokenStream = fields
        .iter()
        .map(|r| {
            let name = &r.name;
            let inner_type = &r.inner_type;
            let big_name = &r.element_name;
            let item_name = r.r#type.to_string();
            let write_list = quote! {
                crate::xml_codec::start_element(writer, #big_name, &[])?;
                for item in items {
                    crate::xml_codec::write_field::<W, #inner_type>(writer, #item_name, item, context)?;
                }
                crate::xml_codec::end_element(writer)?;
            };
            match (r.array, r.option, r.flatten) {
                (true, _, true) => quote! {
                    for item in value.#name {
                        crate::xml_codec::write_field::<W, #inner_type>(writer, #big_name, item, context)?;
                    }
                },
                (true, true, false) => quote! {
                    if let Some(items) = value.#name {
                        #write_list
                    }
                },
                (true, false, false) => quote! {
                    {
                        let items = value.#name;
                        #write_list
                    }
                },
                (false, true, _) => quote! {
                    if let Some(inner) = value.#name {
                        crate::xml_codec::write_field::<W, #inner_type>(writer, #big_name, inner, context)?;
                    }
                },
                (false, false, _) => quote! {
                    crate::xml_codec::write_field::<W, #inner_type>(writer, #big_name, value.#name, context)?;
                },
            }
        })
        .collect();
    quote! {
        impl crate::xml_codec::KdbxSerialize<crate::xml_codec::KdbxContext> for #outer_type {
            fn serialize<W: ::std::io::Write>(
                writer: &mut ::xml::writer::EventWriter<W>,
                value: Self,
                context: &mut crate::xml_codec::KdbxContext,
            ) -> ::std::result::Result<(), ::std::string::String> {
                #elements
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let output = derive_deserializer2(quote! { struct One { field: i32, string: String } });
        assert!(output.to_string().contains("KdbxParse"));
    }

    #[test]
    fn serialize() {
        let output = derive_serializer2(quote! { struct One { field: i32, string: String } });
        assert!(output.to_string().contains("write_field"));
    }

    #[test]
    fn unsupported_enum_is_compile_error() {
        let output = derive_deserializer2(quote! { enum One { A, B } });
        assert!(output.to_string().contains("compile_error"));
    }

    #[test]
    fn decode_attributes_missing() {
        let input = quote! { struct test; };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        let value = KdbxAttributes::parse(&ast.attrs).expect("Error in attributes");
        assert!(!value.flatten);
        assert!(value.element_name.is_none());
    }

    #[test]
    fn decode_attributes_empty() {
        let input = quote! { #[kdbx()] struct test; };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        let value = KdbxAttributes::parse(&ast.attrs).expect("Error in attributes");
        assert!(!value.flatten);
        assert!(value.element_name.is_none());
    }

    #[test]
    fn decode_attributes_full() {
        let input = quote! {
            #[derive(Debug)]
            #[kdbx(flatten, element = "foobar")]
            struct test;
        };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        let value = KdbxAttributes::parse(&ast.attrs).expect("Error in attributes");
        assert!(value.flatten);
        assert_eq!(value.element_name.as_deref(), Some("foobar"));
    }

    #[test]
    fn decode_attributes_misspelled() {
        let input = quote! {
            #[derive(Debug)]
            #[kdbx(flatten, elment = "foobar")]
            struct test;
        };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        assert!(KdbxAttributes::parse(&ast.attrs).is_err());
    }

    #[test]
    fn decode_struct_valid() {
        let input = quote! {
            struct test {
                one: bool,
            }
        };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        let value = decode_struct(&ast).expect("Failed to decode struct");
        assert_eq!(value.len(), 1);
        assert_eq!(value[0].name.to_string(), "one");
        assert_eq!(value[0].r#type.to_string(), "bool");
        assert_eq!(value[0].element_name, "One");
        assert!(!value[0].array);
        assert!(!value[0].option);
        assert!(!value[0].flatten);
    }

    #[test]
    fn decode_struct_complex() {
        let input = quote! {
            struct test {
                #[kdbx(flatten)]
                one: Vec<u32>,
                two: Option<String>,
                three: Vec<bool>,
                four: Option<Vec<i16>>,
                #[kdbx(element = "UUID")]
                five: Vec<u8>,
                six: Option<[u8; 32]>,
            }
        };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        let value = decode_struct(&ast).expect("Failed to decode struct");
        assert_eq!(value.len(), 6);
        assert_eq!(value[0].r#type.to_string(), "u32");
        assert!(value[0].array && !value[0].option && value[0].flatten);
        assert_eq!(value[1].r#type.to_string(), "String");
        assert!(!value[1].array && value[1].option);
        assert_eq!(value[2].element_name, "Three");
        assert!(value[2].array && !value[2].option);
        assert_eq!(value[3].r#type.to_string(), "i16");
        assert!(value[3].array && value[3].option);
        assert_eq!(value[4].element_name, "UUID");
        assert_eq!(value[4].r#type.to_string(), "u8");
        assert!(!value[4].array);
        assert_eq!(value[5].r#type.to_string(), "u8");
        assert!(value[5].option && !value[5].array);
    }

    #[test]
    fn flatten_requires_vec() {
        let input = quote! {
            struct test {
                #[kdbx(flatten)]
                one: u32,
            }
        };
        let ast: syn::DeriveInput = syn::parse2(input).expect("bad parsing");
        assert!(decode_struct(&ast).is_err());
    }
}
